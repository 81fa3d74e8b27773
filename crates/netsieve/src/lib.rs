//! netsieve Request Filtering Engine
//!
//! Decides Allow / Block / Redirect for outbound requests against a
//! hot-swappable set of declarative rules.
//!
//! Architecture:
//! 1. Host request → classifier → normalized descriptor
//! 2. Descriptor → snapshot of the rule store (never torn by updates)
//! 3. Per-type partition + host-suffix index (bloom prefiltered) → candidates
//! 4. Candidates → conflict policy → one verdict, Allow when nothing matches
//! 5. Non-Allow verdicts → event sink (fire-and-forget)

mod classifier;
mod engine;
mod error;
mod event;
mod filter_config;
mod filter_list;
mod index;
mod pattern;
mod rule;
mod store;
mod update;

pub use classifier::{classify, RawRequest, RequestClassifier, RequestDescriptor, TabContext};
pub use engine::{
    AllowPrecedence, ConflictPolicy, DecisionEngine, Evaluation, Resolution, StatsSnapshot, Verdict,
};
pub use error::{ClassificationError, StoreError};
pub use event::{ChannelSink, EventSink, MatchEvent, NullSink, TracingSink};
pub use filter_config::{
    DomainList, FilterConfig, FullFilters, ImportedConfig, PatternList, CONFIG_BLOCK_PRIORITY,
};
pub use filter_list::{default_tracking_domains, FilterList, FilterListError, IMPORTANT_PRIORITY};
pub use pattern::{matches, Pattern, PatternError};
pub use rule::{
    Action, CompiledRule, InitiatorDomains, ResourceType, ResourceTypes, Rule, RuleId,
};
pub use store::{RuleSet, RuleStore};
pub use update::{RuleUpdate, UpdateError};
