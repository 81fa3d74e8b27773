//! Decision Engine
//!
//! Evaluates one request descriptor against a single rule-set snapshot:
//! 1. Candidate lookup by resource type and host suffix
//! 2. Full check of each candidate (enabled, initiator, pattern)
//! 3. Conflict resolution into one verdict
//! 4. No match → Allow
//!
//! Non-Allow verdicts are reported to the event sink after the verdict is
//! fixed; the sink never affects the outcome.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::classifier::{RawRequest, RequestClassifier, RequestDescriptor};
use crate::error::ClassificationError;
use crate::event::{EventSink, MatchEvent, NullSink};
use crate::rule::{Action, CompiledRule, RuleId};
use crate::store::{RuleSet, RuleStore};

/// Final decision for one request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Block {
        matched_rule_id: RuleId,
    },
    Redirect {
        target: String,
        matched_rule_id: RuleId,
    },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    /// The rule behind a Block or Redirect
    pub fn matched_rule_id(&self) -> Option<RuleId> {
        match self {
            Verdict::Allow => None,
            Verdict::Block { matched_rule_id } | Verdict::Redirect { matched_rule_id, .. } => {
                Some(*matched_rule_id)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Verdict::Allow => "Allowed",
            Verdict::Block { .. } => "Blocked",
            Verdict::Redirect { .. } => "Redirected",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => f.write_str("allow"),
            Verdict::Block { matched_rule_id } => write!(f, "block (rule {})", matched_rule_id),
            Verdict::Redirect {
                target,
                matched_rule_id,
            } => write!(f, "redirect to {} (rule {})", target, matched_rule_id),
        }
    }
}

/// When a matching Allow rule beats the strongest Block/Redirect match
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowPrecedence {
    /// Allow priority >= blocking priority
    #[default]
    AtOrAbove,
    /// Allow priority > blocking priority
    StrictlyAbove,
    /// No special treatment: highest priority, then lowest id
    PriorityOnly,
}

/// Conflict resolution between matching rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    #[serde(default)]
    pub allow_precedence: AllowPrecedence,
}

/// Outcome of conflict resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: Verdict,
    /// Winning rule, including an Allow rule that produced an Allow verdict
    pub decided_by: Option<RuleId>,
}

/// `a` ranks above `b`: higher priority, then lower id
#[inline]
fn outranks(a: &CompiledRule, b: &CompiledRule) -> bool {
    a.priority() > b.priority() || (a.priority() == b.priority() && a.id() < b.id())
}

fn strongest<'a>(rules: impl Iterator<Item = &'a CompiledRule>) -> Option<&'a CompiledRule> {
    rules.fold(None, |best, rule| match best {
        Some(b) if !outranks(rule, b) => Some(b),
        _ => Some(rule),
    })
}

fn verdict_for(rule: &CompiledRule) -> Verdict {
    match rule.action() {
        Action::Allow => Verdict::Allow,
        Action::Block => Verdict::Block {
            matched_rule_id: rule.id(),
        },
        Action::Redirect { target } => Verdict::Redirect {
            target: target.clone(),
            matched_rule_id: rule.id(),
        },
    }
}

impl ConflictPolicy {
    /// Resolve the set of fully matching rules into one verdict
    pub fn resolve(&self, matched: &[&CompiledRule]) -> Resolution {
        let blocking = strongest(matched.iter().copied().filter(|r| !r.action().is_allow()));
        let allowing = strongest(matched.iter().copied().filter(|r| r.action().is_allow()));

        let Some(blocking) = blocking else {
            return Resolution {
                verdict: Verdict::Allow,
                decided_by: allowing.map(|r| r.id()),
            };
        };

        let allow_wins = allowing.is_some_and(|allow| match self.allow_precedence {
            AllowPrecedence::AtOrAbove => allow.priority() >= blocking.priority(),
            AllowPrecedence::StrictlyAbove => allow.priority() > blocking.priority(),
            AllowPrecedence::PriorityOnly => outranks(allow, blocking),
        });

        let winner = match allowing {
            Some(allow) if allow_wins => allow,
            _ => blocking,
        };

        Resolution {
            verdict: verdict_for(winner),
            decided_by: Some(winner.id()),
        }
    }
}

/// Full result of evaluating one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Every fully matching rule, ascending by id
    pub matched: Vec<RuleId>,
    pub decided_by: Option<RuleId>,
    /// Generation of the snapshot that was evaluated
    pub generation: u64,
}

/// Engine statistics
#[derive(Debug, Default)]
struct EngineStats {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    redirected_requests: AtomicU64,
    total_check_time_ns: AtomicU64,
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub redirected_requests: u64,
    pub total_check_time_ns: u64,
}

impl StatsSnapshot {
    /// Counters are read independently, so a snapshot taken under load may
    /// briefly count more blocks than requests.
    pub fn allowed_requests(&self) -> u64 {
        self.total_requests
            .saturating_sub(self.blocked_requests)
            .saturating_sub(self.redirected_requests)
    }

    /// Average check time in nanoseconds
    pub fn avg_check_time_ns(&self) -> u64 {
        if self.total_requests == 0 {
            return 0;
        }
        self.total_check_time_ns / self.total_requests
    }
}

/// Decides Allow / Block / Redirect for requests against a shared store
pub struct DecisionEngine {
    store: Arc<RuleStore>,
    sink: Arc<dyn EventSink>,
    policy: ConflictPolicy,
    classifier: RequestClassifier,
    stats: EngineStats,
}

impl DecisionEngine {
    /// Engine with the default policy and no event sink
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self {
            store,
            sink: Arc::new(NullSink),
            policy: ConflictPolicy::default(),
            classifier: RequestClassifier::default(),
            stats: EngineStats::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_classifier(mut self, classifier: RequestClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Evaluate without notifying the sink or touching statistics
    pub fn evaluate(&self, descriptor: &RequestDescriptor) -> Evaluation {
        let snapshot = self.store.snapshot();
        self.evaluate_in(&snapshot, descriptor)
    }

    fn evaluate_in(&self, rules: &RuleSet, descriptor: &RequestDescriptor) -> Evaluation {
        let mut matched: Vec<&CompiledRule> = rules
            .candidates_for(descriptor.resource_type(), descriptor.host())
            .filter(|rule| {
                rule.applies_to(
                    descriptor.url(),
                    descriptor.resource_type(),
                    descriptor.initiator_domain(),
                )
            })
            .collect();
        matched.sort_unstable_by_key(|rule| rule.id());

        let resolution = self.policy.resolve(&matched);

        Evaluation {
            verdict: resolution.verdict,
            matched: matched.iter().map(|rule| rule.id()).collect(),
            decided_by: resolution.decided_by,
            generation: rules.generation(),
        }
    }

    /// Decide one request.
    ///
    /// This is the HOT PATH. Deterministic for a given descriptor and
    /// rule-set state.
    pub fn decide(&self, descriptor: &RequestDescriptor) -> Verdict {
        let start = Instant::now();
        let evaluation = self.evaluate(descriptor);
        let elapsed = start.elapsed().as_nanos() as u64;

        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        self.stats.total_check_time_ns.fetch_add(elapsed, Ordering::Relaxed);
        trace!(
            url = %descriptor.url(),
            matched = evaluation.matched.len(),
            elapsed_ns = elapsed,
            "Evaluated request"
        );

        let verdict = evaluation.verdict;
        if let Some(rule_id) = verdict.matched_rule_id() {
            let counter = match &verdict {
                Verdict::Redirect { .. } => &self.stats.redirected_requests,
                _ => &self.stats.blocked_requests,
            };
            counter.fetch_add(1, Ordering::Relaxed);

            debug!(rule_id, url = %descriptor.url(), "{} request", verdict.kind());

            self.sink.on_match(&MatchEvent {
                rule_id,
                verdict: verdict.clone(),
                descriptor: descriptor.clone(),
            });
        }

        verdict
    }

    /// Classify a raw host request, then decide it
    pub fn classify_and_decide(&self, raw: &RawRequest) -> Result<Verdict, ClassificationError> {
        let descriptor = self.classifier.classify(raw)?;
        Ok(self.decide(&descriptor))
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            blocked_requests: self.stats.blocked_requests.load(Ordering::Relaxed),
            redirected_requests: self.stats.redirected_requests.load(Ordering::Relaxed),
            total_check_time_ns: self.stats.total_check_time_ns.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("store", &self.store)
            .field("policy", &self.policy)
            .finish()
    }
}
