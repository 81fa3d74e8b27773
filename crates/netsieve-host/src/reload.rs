//! Rule source loading and hot reload
//!
//! Sources are JSON rule files, EasyList text lists, JSON filter configs
//! and the built-in tracking defaults. A reload rebuilds the whole rule set and installs it
//! with `replace_all`, so a broken source leaves the running set untouched.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use netsieve::{FilterConfig, FilterList, FilterListError, Rule, RuleId, RuleStore, RuleUpdate};
use tracing::{debug, info, warn};

use crate::config::RulesConfig;

/// Everything the rule set is built from
#[derive(Debug, Clone)]
pub struct RuleSources {
    files: Vec<PathBuf>,
    filter_lists: Vec<PathBuf>,
    filter_configs: Vec<PathBuf>,
    seed_tracking_defaults: bool,
    base_id: RuleId,
}

/// Result of reading every source
#[derive(Debug, Default)]
pub struct LoadedRules {
    pub rules: Vec<Rule>,
    /// Console-only patterns from filter configs
    pub quiet_patterns: Vec<String>,
}

impl RuleSources {
    pub fn from_config(config: &RulesConfig) -> Self {
        Self {
            files: config.files.clone(),
            filter_lists: config.filter_lists.clone(),
            filter_configs: config.filter_configs.clone(),
            seed_tracking_defaults: config.seed_tracking_defaults,
            base_id: config.filter_list_base_id,
        }
    }

    /// Read every source into one rule list
    pub fn load(&self) -> Result<LoadedRules> {
        let mut rules = Vec::new();
        let mut quiet_patterns = Vec::new();

        for path in &self.files {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading rules {}", path.display()))?;
            match RuleUpdate::from_json(&text)
                .with_context(|| format!("parsing rules {}", path.display()))?
            {
                RuleUpdate::Replace { rules: file_rules } => rules.extend(file_rules),
                RuleUpdate::Incremental { .. } => {
                    bail!("{}: rule files must hold a full rule set", path.display())
                }
            }
        }

        // Imported rules are numbered consecutively from the base id
        let mut next_id = self.base_id;
        for path in &self.filter_lists {
            let file = File::open(path)
                .with_context(|| format!("opening filter list {}", path.display()))?;
            let name = path.display().to_string();
            match FilterList::parse(&name, file, next_id) {
                Ok(list) => {
                    next_id = next_id.saturating_add(list.rule_count() as RuleId);
                    rules.extend(list.rules);
                }
                Err(FilterListError::EmptyList) => {
                    warn!("Filter list {} has no usable rules", name);
                }
                Err(e) => return Err(e).with_context(|| format!("reading filter list {}", name)),
            }
        }

        for path in &self.filter_configs {
            let file = File::open(path)
                .with_context(|| format!("opening filter config {}", path.display()))?;
            let imported = FilterConfig::from_reader(file)
                .with_context(|| format!("parsing filter config {}", path.display()))?
                .import(next_id);
            next_id = next_id.saturating_add(imported.rules.len() as RuleId);
            rules.extend(imported.rules);
            quiet_patterns.extend(imported.quiet_patterns);
        }

        if self.seed_tracking_defaults {
            rules.extend(FilterList::tracking_defaults(next_id).rules);
        }

        Ok(LoadedRules { rules, quiet_patterns })
    }

    /// Modification times of every file source, `None` for unreadable ones
    pub fn modified(&self) -> Vec<Option<SystemTime>> {
        self.files
            .iter()
            .chain(&self.filter_lists)
            .chain(&self.filter_configs)
            .map(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok())
            .collect()
    }

    /// Compare against `last_seen` and record the current times
    pub fn changed(&self, last_seen: &mut Vec<Option<SystemTime>>) -> bool {
        let current = self.modified();
        if current == *last_seen {
            return false;
        }
        *last_seen = current;
        true
    }
}

/// Build the rule set from `sources` and install it.
/// Returns the console-only patterns found along the way.
pub fn reload(store: &RuleStore, sources: &RuleSources) -> Result<Vec<String>> {
    let LoadedRules { rules, quiet_patterns } = sources.load()?;
    let count = rules.len();
    store.replace_all(rules).context("installing rule set")?;
    info!("Loaded {} rules (generation {})", count, store.generation());
    Ok(quiet_patterns)
}

/// Poll source mtimes and reload on change. Runs until the runtime shuts down.
///
/// `baseline` must be taken before the initial load, so an edit that lands
/// during that load is picked up on the first tick.
pub async fn watch(
    store: Arc<RuleStore>,
    sources: Arc<RuleSources>,
    baseline: Vec<Option<SystemTime>>,
    period: Duration,
) {
    let mut last_seen = baseline;
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        interval.tick().await;

        if !sources.changed(&mut last_seen) {
            continue;
        }
        debug!("Rule sources changed, reloading");

        let store = Arc::clone(&store);
        let sources = Arc::clone(&sources);
        let result = tokio::task::spawn_blocking(move || {
            reload(&store, &sources).map_err(|e| (e, store.generation()))
        })
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err((e, generation))) => {
                warn!("Reload failed, keeping generation {}: {:#}", generation, e);
            }
            Err(e) => warn!("Reload task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("netsieve-host-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    fn sources(files: Vec<PathBuf>, lists: Vec<PathBuf>, defaults: bool) -> RuleSources {
        RuleSources::from_config(&RulesConfig {
            files,
            filter_lists: lists,
            filter_configs: Vec::new(),
            seed_tracking_defaults: defaults,
            filter_list_base_id: 1_000,
            reload_interval_ms: 0,
        })
    }

    #[test]
    fn test_load_all_sources() {
        let dir = scratch_dir("load");
        let rules_path = dir.join("rules.json");
        let list_path = dir.join("list.txt");
        write(
            &rules_path,
            r#"[{"id": 1, "action": {"type": "block"}, "pattern": "||ads.example.com^"}]"#,
        );
        write(&list_path, "! list\n||tracker.net^\n@@||tracker.net/ok^\n");

        let rules = sources(vec![rules_path], vec![list_path], true).load().unwrap().rules;
        let ids: Vec<RuleId> = rules.iter().map(|r| r.id).take(3).collect();
        assert_eq!(ids, vec![1, 1_000, 1_001]);
        assert_eq!(rules.len(), 3 + netsieve::default_tracking_domains().len());
        assert_eq!(rules[3].id, 1_002);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_failed_reload_keeps_rules() {
        let dir = scratch_dir("keep");
        let rules_path = dir.join("rules.json");
        write(
            &rules_path,
            r#"{"mode": "replace", "rules": [{"id": 1, "action": {"type": "block"}, "pattern": "||ads.example.com^"}]}"#,
        );
        let sources = sources(vec![rules_path.clone()], vec![], false);

        let store = RuleStore::new();
        reload(&store, &sources).unwrap();
        let fingerprint = store.fingerprint();
        assert_eq!(store.len(), 1);

        write(
            &rules_path,
            r#"[{"id": 2, "action": {"type": "block"}, "pattern": ""}]"#,
        );
        assert!(reload(&store, &sources).is_err());
        assert_eq!(store.fingerprint(), fingerprint);

        write(&rules_path, "{ truncated");
        assert!(reload(&store, &sources).is_err());
        assert_eq!(store.len(), 1);

        write(
            &rules_path,
            r#"{"mode": "incremental", "remove_rule_ids": [1]}"#,
        );
        assert!(sources.load().is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_source() {
        let sources = sources(vec![PathBuf::from("/nonexistent/rules.json")], vec![], true);
        assert!(sources.load().is_err());
        assert_eq!(sources.modified(), vec![None]);
    }

    #[test]
    fn test_filter_config_source() {
        let dir = scratch_dir("config");
        let list_path = dir.join("list.txt");
        let config_path = dir.join("filter_config.json");
        write(&list_path, "||tracker.net^\n");
        write(
            &config_path,
            r#"{
                "full_filters": {"domains": ["doubleclick.net"], "patterns": ["/banner/"]},
                "domain_whitelist": {"domains": ["shop.example"]},
                "console_only_filters": {"patterns": ["/log/collect"]}
            }"#,
        );

        let mut sources = sources(vec![], vec![list_path], true);
        sources.filter_configs = vec![config_path.clone()];
        let loaded = sources.load().unwrap();

        let ids: Vec<RuleId> = loaded.rules.iter().map(|r| r.id).take(4).collect();
        assert_eq!(ids, vec![1_000, 1_001, 1_002, 1_003]);
        assert_eq!(loaded.rules[1].pattern, "||doubleclick.net^");
        assert_eq!(loaded.rules[4].id, 1_004);
        assert_eq!(loaded.quiet_patterns, vec!["/log/collect"]);

        let store = RuleStore::new();
        assert_eq!(reload(&store, &sources).unwrap(), vec!["/log/collect"]);
        assert!(store.get(1_003).is_some_and(|r| r.action.is_allow()));

        write(&config_path, r#"{"full_filters": {"domains": 3}}"#);
        assert!(reload(&store, &sources).is_err());
        assert!(store.get(1_003).is_some());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_edit_during_initial_load_is_seen() {
        let dir = scratch_dir("baseline");
        let rules_path = dir.join("rules.json");
        write(
            &rules_path,
            r#"[{"id": 1, "action": {"type": "block"}, "pattern": "||ads.example.com^"}]"#,
        );
        let stamp = |secs: u64| {
            File::options()
                .write(true)
                .open(&rules_path)
                .unwrap()
                .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
                .unwrap();
        };
        stamp(1_000);
        let sources = sources(vec![rules_path.clone()], vec![], false);

        // Baseline first, then the file changes before the watcher starts
        let mut last_seen = sources.modified();
        let store = RuleStore::new();
        reload(&store, &sources).unwrap();
        stamp(2_000);

        assert!(sources.changed(&mut last_seen));
        assert!(!sources.changed(&mut last_seen));

        std::fs::remove_dir_all(&dir).ok();
    }
}
