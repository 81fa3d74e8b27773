//! Rule update documents
//!
//! The host hands rule changes in as JSON:
//! - a bare array of rules, or `{"mode": "replace", "rules": [...]}`
//! - `{"mode": "incremental", "remove_rule_ids": [...], "add_rules": [...]}`

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rule::{Rule, RuleId};

/// Malformed update document
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("malformed rule update: {0}")]
    Json(#[from] serde_json::Error),
}

/// A full or incremental rule-set change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RuleUpdate {
    /// Install exactly these rules
    Replace { rules: Vec<Rule> },
    /// Remove ids, then add rules, as one atomic step
    Incremental {
        #[serde(default)]
        remove_rule_ids: Vec<RuleId>,
        #[serde(default)]
        add_rules: Vec<Rule>,
    },
}

impl RuleUpdate {
    pub fn from_json(text: &str) -> Result<Self, UpdateError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.is_array() {
            return Ok(Self::Replace {
                rules: serde_json::from_value(value)?,
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Number of rules carried by the update
    pub fn rule_count(&self) -> usize {
        match self {
            Self::Replace { rules } => rules.len(),
            Self::Incremental { add_rules, .. } => add_rules.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Action, ResourceType};

    #[test]
    fn test_bare_array_is_replace() {
        let update = RuleUpdate::from_json(
            r#"[{"id": 1, "action": {"type": "block"}, "pattern": "||ads.example.com^",
                 "resource_types": ["script"]}]"#,
        )
        .unwrap();
        let RuleUpdate::Replace { rules } = update else {
            panic!("expected replace");
        };
        assert_eq!(rules.len(), 1);
        assert!(rules[0].resource_types.contains(ResourceType::Script));
    }

    #[test]
    fn test_incremental() {
        let update = RuleUpdate::from_json(
            r#"{"mode": "incremental", "remove_rule_ids": [4, 5],
                "add_rules": [{"id": 6, "action": {"type": "allow"}, "pattern": "||ok.com^"}]}"#,
        )
        .unwrap();
        match update {
            RuleUpdate::Incremental {
                remove_rule_ids,
                add_rules,
            } => {
                assert_eq!(remove_rule_ids, vec![4, 5]);
                assert_eq!(add_rules[0].action, Action::Allow);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed() {
        assert!(RuleUpdate::from_json("{").is_err());
        assert!(RuleUpdate::from_json(r#"{"mode": "merge"}"#).is_err());
        assert!(RuleUpdate::from_json(r#"[{"id": 1, "pattern": "x"}]"#).is_err());
    }
}
