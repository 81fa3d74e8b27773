//! Error types for rule-store mutation and request classification.

use thiserror::Error;

use crate::pattern::PatternError;
use crate::rule::RuleId;

/// Errors from rule-store mutations. A failed mutation never changes the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("rule {id}: invalid pattern: {source}")]
    Pattern {
        id: RuleId,
        #[source]
        source: PatternError,
    },

    #[error("duplicate rule id {0}")]
    DuplicateId(RuleId),

    #[error("rule {0} not found")]
    NotFound(RuleId),

    #[error("rule {0}: redirect action without target")]
    MissingRedirectTarget(RuleId),

    #[error("rule {id}: invalid redirect target '{target}'")]
    InvalidRedirectTarget { id: RuleId, target: String },
}

impl StoreError {
    /// The rule the error refers to
    pub fn rule_id(&self) -> RuleId {
        match self {
            Self::Pattern { id, .. } | Self::InvalidRedirectTarget { id, .. } => *id,
            Self::DuplicateId(id) | Self::NotFound(id) | Self::MissingRedirectTarget(id) => *id,
        }
    }
}

/// Raw request could not be normalized into a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("request has an empty URL")]
    EmptyUrl,

    #[error("unparsable URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}
