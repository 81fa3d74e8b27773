//! Candidate index
//!
//! Rules are partitioned by resource type, then bucketed by the fixed
//! suffix of their host pattern. A lookup probes one bucket per label
//! suffix of the request host plus the per-type bucket of host-less
//! patterns, so its cost follows host depth rather than rule count.
//!
//! A Bloom filter over all host keys sits in front of the hash probes:
//! false positives only cost a map miss, false negatives are impossible.

use std::fmt;
use std::sync::Arc;

use bloomfilter::Bloom;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::rule::{CompiledRule, ResourceType};

/// False positive rate of the host-key prefilter
const HOST_KEY_FALSE_POSITIVE_RATE: f64 = 0.001;

#[derive(Default)]
struct Partition {
    by_host: FxHashMap<String, Vec<Arc<CompiledRule>>>,
    /// Patterns with no fixed host suffix
    generic: Vec<Arc<CompiledRule>>,
}

pub(crate) struct RuleIndex {
    partitions: [Partition; ResourceType::ALL.len()],
    host_keys: Bloom<[u8]>,
    key_count: usize,
}

impl RuleIndex {
    /// Build the index. Disabled rules are left out since they never match.
    pub(crate) fn build<'a>(rules: impl IntoIterator<Item = &'a Arc<CompiledRule>>) -> Self {
        let mut partitions: [Partition; ResourceType::ALL.len()] =
            std::array::from_fn(|_| Partition::default());
        let mut keys: FxHashSet<&str> = FxHashSet::default();

        for rule in rules {
            if !rule.rule().enabled {
                continue;
            }

            let key = rule.pattern().host_key();
            let types = rule.rule().resource_types;

            for t in ResourceType::ALL.into_iter().filter(|t| types.covers(*t)) {
                let partition = &mut partitions[t.index()];
                match key {
                    Some(key) => partition
                        .by_host
                        .entry(key.to_string())
                        .or_default()
                        .push(Arc::clone(rule)),
                    None => partition.generic.push(Arc::clone(rule)),
                }
            }

            if let Some(key) = key {
                keys.insert(key);
            }
        }

        let mut host_keys =
            Bloom::new_for_fp_rate(keys.len().max(1), HOST_KEY_FALSE_POSITIVE_RATE);
        for key in &keys {
            host_keys.set(key.as_bytes());
        }

        Self {
            partitions,
            host_keys,
            key_count: keys.len(),
        }
    }

    /// Rules that could match a request of type `t` to `host` (lowercase)
    pub(crate) fn candidates<'a>(
        &'a self,
        t: ResourceType,
        host: &'a str,
    ) -> impl Iterator<Item = &'a Arc<CompiledRule>> + 'a {
        let partition = &self.partitions[t.index()];

        host_suffixes(host)
            .filter(|suffix| self.host_keys.check(suffix.as_bytes()))
            .filter_map(|suffix| partition.by_host.get(suffix))
            .flatten()
            .chain(partition.generic.iter())
    }

    /// Number of distinct host keys
    pub(crate) fn key_count(&self) -> usize {
        self.key_count
    }
}

impl fmt::Debug for RuleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleIndex")
            .field("host_keys", &self.key_count)
            .field(
                "generic",
                &self.partitions.iter().map(|p| p.generic.len()).sum::<usize>(),
            )
            .finish()
    }
}

/// `a.b.example.com` → `a.b.example.com`, `b.example.com`, `example.com`, `com`
fn host_suffixes(host: &str) -> impl Iterator<Item = &str> {
    std::iter::once(host)
        .chain(host.match_indices('.').map(|(i, _)| &host[i + 1..]))
        .filter(|s| !s.is_empty())
}
