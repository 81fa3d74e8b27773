//! Event Sink
//!
//! Match events are outbound notifications only. Sinks cannot fail and
//! cannot influence the verdict; a slow consumer loses events, never requests.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{info, trace};

use crate::classifier::RequestDescriptor;
use crate::engine::Verdict;
use crate::pattern::{Pattern, PatternError};
use crate::rule::RuleId;

/// Emitted for every non-Allow verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEvent {
    pub rule_id: RuleId,
    pub verdict: Verdict,
    pub descriptor: RequestDescriptor,
}

/// Receiver of match events
pub trait EventSink: Send + Sync {
    fn on_match(&self, event: &MatchEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_match(&self, _event: &MatchEvent) {}
}

/// Logs matches through `tracing`.
///
/// URLs matching a quiet pattern are only logged at trace level.
#[derive(Debug, Default)]
pub struct TracingSink {
    quiet: Vec<Pattern>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quiet_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let quiet = patterns
            .iter()
            .map(|p| Pattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { quiet })
    }

    fn is_quiet(&self, event: &MatchEvent) -> bool {
        self.quiet.iter().any(|p| p.matches(event.descriptor.url()))
    }
}

impl EventSink for TracingSink {
    fn on_match(&self, event: &MatchEvent) {
        let d = &event.descriptor;
        if self.is_quiet(event) {
            trace!(rule_id = event.rule_id, url = %d.url(), "Matched (quiet)");
            return;
        }
        info!(
            rule_id = event.rule_id,
            resource_type = %d.resource_type(),
            initiator = d.initiator_domain().unwrap_or("-"),
            tab = %d.tab_context().map(|t| t.to_string()).unwrap_or_default(),
            "{} request: {}",
            event.verdict.kind(),
            d.url()
        );
    }
}

/// Forwards events over a bounded channel without ever blocking the caller
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<MatchEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn bounded(capacity: usize) -> (Self, Receiver<MatchEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn on_match(&self, event: &MatchEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(rule_id = event.rule_id, "Event receiver gone");
            }
        }
    }
}
