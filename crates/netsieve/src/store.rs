//! Rule Store
//!
//! Holds the active rule set as an immutable snapshot behind an `ArcSwap`.
//! Readers load the current snapshot without locking and keep using it for
//! the whole evaluation. Writers are serialized by a mutex, build a complete
//! new snapshot off to the side, and install it with a single atomic store,
//! so no reader ever sees a half-applied update.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::error::StoreError;
use crate::index::RuleIndex;
use crate::rule::{CompiledRule, ResourceType, Rule, RuleId};
use crate::update::RuleUpdate;

type RuleMap = BTreeMap<RuleId, Arc<CompiledRule>>;

/// An immutable, indexed snapshot of the installed rules
#[derive(Debug)]
pub struct RuleSet {
    rules: RuleMap,
    index: RuleIndex,
    generation: u64,
    fingerprint: u64,
}

impl RuleSet {
    fn build(rules: RuleMap, generation: u64) -> Self {
        let index = RuleIndex::build(rules.values());
        let fingerprint = fingerprint(&rules);
        Self {
            rules,
            index,
            generation,
            fingerprint,
        }
    }

    /// Rules whose resource types include `resource_type` and whose host
    /// bucket could match `host`. Lazy; full pattern evaluation is left to the caller.
    pub fn candidates_for<'a>(
        &'a self,
        resource_type: ResourceType,
        host: &'a str,
    ) -> impl Iterator<Item = &'a CompiledRule> + 'a {
        self.index
            .candidates(resource_type, host)
            .map(|rule| rule.as_ref())
    }

    pub fn get(&self, id: RuleId) -> Option<&CompiledRule> {
        self.rules.get(&id).map(|rule| rule.as_ref())
    }

    pub fn contains(&self, id: RuleId) -> bool {
        self.rules.contains_key(&id)
    }

    /// All rules, ascending by id
    pub fn iter(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.values().map(|rule| rule.as_ref())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Incremented on every installed mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Content hash of the rules; equal rule sets have equal fingerprints
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

/// Order-independent: rules are hashed ascending by id
fn fingerprint(rules: &RuleMap) -> u64 {
    let mut hasher = Xxh3::new();
    for rule in rules.values() {
        rule.rule().hash(&mut hasher);
    }
    hasher.finish()
}

/// Compile a batch into a fresh map, rejecting duplicate ids within it
fn compile_all(rules: Vec<Rule>) -> Result<RuleMap, StoreError> {
    let mut map = RuleMap::new();
    for rule in rules {
        let id = rule.id;
        if map.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }
        map.insert(id, Arc::new(rule.compile()?));
    }
    Ok(map)
}

/// Shared, concurrently readable rule store
pub struct RuleStore {
    current: ArcSwap<RuleSet>,
    write_lock: Mutex<()>,
}

impl RuleStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::build(RuleMap::new(), 0)),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a store seeded with `rules`
    pub fn with_rules(rules: Vec<Rule>) -> Result<Self, StoreError> {
        let store = Self::new();
        store.replace_all(rules)?;
        Ok(store)
    }

    /// The current snapshot. Holding it pins that version for as long as needed.
    #[inline]
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Add one rule. Fails if the id is taken or the rule does not compile.
    pub fn add(&self, rule: Rule) -> Result<(), StoreError> {
        self.mutate("add", |rules| {
            if rules.contains_key(&rule.id) {
                return Err(StoreError::DuplicateId(rule.id));
            }
            rules.insert(rule.id, Arc::new(rule.compile()?));
            Ok(())
        })
    }

    /// Remove one rule by id
    pub fn remove(&self, id: RuleId) -> Result<(), StoreError> {
        self.mutate("remove", |rules| {
            rules.remove(&id).map(|_| ()).ok_or(StoreError::NotFound(id))
        })
    }

    /// Validate and compile every rule, then install them as the whole rule set.
    ///
    /// All-or-nothing: on error the previous set stays installed.
    pub fn replace_all(&self, rules: Vec<Rule>) -> Result<(), StoreError> {
        self.mutate("replace_all", |current| {
            *current = compile_all(rules)?;
            Ok(())
        })
    }

    /// Apply a full or incremental update atomically
    pub fn apply(&self, update: RuleUpdate) -> Result<(), StoreError> {
        match update {
            RuleUpdate::Replace { rules } => self.replace_all(rules),
            RuleUpdate::Incremental {
                remove_rule_ids,
                add_rules,
            } => self.mutate("incremental", |rules| {
                for id in remove_rule_ids {
                    rules.remove(&id).ok_or(StoreError::NotFound(id))?;
                }
                for rule in add_rules {
                    if rules.contains_key(&rule.id) {
                        return Err(StoreError::DuplicateId(rule.id));
                    }
                    rules.insert(rule.id, Arc::new(rule.compile()?));
                }
                Ok(())
            }),
        }
    }

    pub fn get(&self, id: RuleId) -> Option<Rule> {
        self.current.load().get(id).map(|rule| rule.rule().clone())
    }

    /// Copy of every installed rule, ascending by id
    pub fn rules(&self) -> Vec<Rule> {
        self.current.load().iter().map(|rule| rule.rule().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation()
    }

    pub fn fingerprint(&self) -> u64 {
        self.current.load().fingerprint()
    }

    /// Run `op` on a private copy of the rule map and install the result.
    ///
    /// Writers hold `write_lock` for the whole copy-modify-store cycle;
    /// readers are never blocked.
    fn mutate<F>(&self, op: &'static str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut RuleMap) -> Result<(), StoreError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current.load_full();

        let mut rules = current.rules.clone();
        if let Err(e) = f(&mut rules) {
            warn!(op, rule_id = e.rule_id(), "Rule update rejected: {}", e);
            return Err(e);
        }

        let next = RuleSet::build(rules, current.generation + 1);
        if next.fingerprint == current.fingerprint {
            debug!(op, generation = next.generation, "Rule set content unchanged");
        }
        info!(
            op,
            rules = next.len(),
            host_keys = next.index.key_count(),
            generation = next.generation,
            fingerprint = %format!("{:016x}", next.fingerprint),
            "Installed rule set"
        );

        self.current.store(Arc::new(next));
        Ok(())
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("current", &*self.current.load())
            .finish()
    }
}
