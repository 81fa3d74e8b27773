//! Host configuration (TOML)
//!
//! ```toml
//! [rules]
//! files = ["rules/site.json"]
//! filter_lists = ["lists/easylist.txt"]
//! filter_configs = ["filter_config.json"]
//! seed_tracking_defaults = true
//! reload_interval_ms = 2000
//!
//! [policy]
//! allow_precedence = "at_or_above"
//!
//! [events]
//! quiet_patterns = ["||telemetry.internal^"]
//! channel_capacity = 1024
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use netsieve::{ConflictPolicy, RuleId};
use serde::{Deserialize, Serialize};

/// Top-level host configuration. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub rules: RulesConfig,
    pub policy: ConflictPolicy,
    pub events: EventsConfig,
}

/// Where rules come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// JSON rule files (bare array or `{"mode": "replace", ...}`)
    pub files: Vec<PathBuf>,
    /// EasyList-format text lists
    pub filter_lists: Vec<PathBuf>,
    /// JSON filter configs (`full_filters` / `domain_whitelist` / `console_only_filters`)
    pub filter_configs: Vec<PathBuf>,
    /// Add the built-in tracking-domain block list
    pub seed_tracking_defaults: bool,
    /// First id handed to imported list, config and default rules
    pub filter_list_base_id: RuleId,
    /// Poll interval for source changes, 0 disables hot reload
    pub reload_interval_ms: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            filter_lists: Vec::new(),
            filter_configs: Vec::new(),
            seed_tracking_defaults: true,
            filter_list_base_id: 1_000_000,
            reload_interval_ms: 2_000,
        }
    }
}

/// Match event delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// URLs matching these patterns are not logged at info level
    pub quiet_patterns: Vec<String>,
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            quiet_patterns: Vec::new(),
            channel_capacity: 1024,
        }
    }
}

impl HostConfig {
    /// Load from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.resolve_relative_to(path.parent().unwrap_or(Path::new(".")));
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Make rule source paths relative to the config file's directory
    fn resolve_relative_to(&mut self, base: &Path) {
        for path in self
            .rules
            .files
            .iter_mut()
            .chain(self.rules.filter_lists.iter_mut())
            .chain(self.rules.filter_configs.iter_mut())
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}
