//! Filter Config Import (JSON)
//!
//! Loads the JSON filter configuration kept next to the crawler scripts:
//!
//! ```json
//! {
//!   "full_filters": {"domains": ["doubleclick.net"], "patterns": ["/banner/", "/gtm\\.js"]},
//!   "domain_whitelist": {"domains": ["coupang.com"]},
//!   "console_only_filters": {"patterns": ["/log/collect"]}
//! }
//! ```
//!
//! Entries are regular expressions. Only the literal subset converts:
//! escapes, `.*`, and `^` / `$` at the ends. Anything else is skipped and counted.
//! Conversion keeps case as written; only the host span of a URL folds case.

use std::io::Read;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::filter_list::FilterListError;
use crate::pattern::Pattern;
use crate::rule::{Rule, RuleId};

/// Priority of imported block rules.
///
/// Whitelisted domains are still subject to block patterns, so blocks
/// rank above the whitelist's allow rules.
pub const CONFIG_BLOCK_PRIORITY: i32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullFilters {
    pub domains: Vec<String>,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainList {
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternList {
    pub patterns: Vec<String>,
}

/// The JSON filter configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Blocked domains and URL patterns
    pub full_filters: FullFilters,
    /// Domains allowed unless a block pattern also matches
    pub domain_whitelist: DomainList,
    /// Matches that are logged but kept off the console
    pub console_only_filters: PatternList,
}

/// Rules and quiet patterns converted from a [`FilterConfig`]
#[derive(Debug, Clone, Default)]
pub struct ImportedConfig {
    pub rules: Vec<Rule>,
    /// Patterns for [`TracingSink::with_quiet_patterns`](crate::TracingSink::with_quiet_patterns)
    pub quiet_patterns: Vec<String>,
    /// Entries with regex syntax that has no pattern equivalent
    pub unsupported: usize,
}

impl ImportedConfig {
    fn push_rule(&mut self, rule: Rule, entry: &str) {
        match rule.clone().compile() {
            Ok(_) => self.rules.push(rule),
            Err(e) => {
                debug!("Skipping filter config entry '{}': {}", entry, e);
                self.unsupported += 1;
            }
        }
    }

    fn skip(&mut self, entry: &str) {
        debug!("Skipping filter config entry '{}': unsupported regex", entry);
        self.unsupported += 1;
    }
}

impl FilterConfig {
    pub fn from_json(text: &str) -> Result<Self, FilterListError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, FilterListError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Convert to rules numbered consecutively from `first_id`
    pub fn import(&self, first_id: RuleId) -> ImportedConfig {
        let mut out = ImportedConfig::default();
        let next_id = |out: &ImportedConfig| first_id.saturating_add(out.rules.len() as RuleId);

        for entry in &self.full_filters.domains {
            match domain_pattern(entry) {
                Some(pattern) => {
                    let rule = Rule::block(next_id(&out), pattern).with_priority(CONFIG_BLOCK_PRIORITY);
                    out.push_rule(rule, entry);
                }
                None => out.skip(entry),
            }
        }

        for entry in &self.full_filters.patterns {
            match glob_from_regex(entry) {
                Some(pattern) => {
                    let rule = Rule::block(next_id(&out), pattern).with_priority(CONFIG_BLOCK_PRIORITY);
                    out.push_rule(rule, entry);
                }
                None => out.skip(entry),
            }
        }

        for entry in &self.domain_whitelist.domains {
            match domain_pattern(entry) {
                Some(pattern) => {
                    let rule = Rule::allow(next_id(&out), pattern);
                    out.push_rule(rule, entry);
                }
                None => out.skip(entry),
            }
        }

        for entry in &self.console_only_filters.patterns {
            match glob_from_regex(entry).filter(|p| Pattern::compile(p).is_ok()) {
                Some(pattern) => out.quiet_patterns.push(pattern),
                None => out.skip(entry),
            }
        }

        info!(
            "Imported filter config: {} rules, {} quiet patterns, {} unsupported",
            out.rules.len(),
            out.quiet_patterns.len(),
            out.unsupported
        );
        out
    }
}

/// `ads.example.com` (optionally regex-escaped) → `||ads.example.com^`
fn domain_pattern(entry: &str) -> Option<String> {
    let domain = unescape(entry.trim())?;
    let domain = domain.trim_start_matches("*.").trim_start_matches('.');
    if domain.is_empty() || domain.contains(['*', '/', '^', '|']) {
        return None;
    }
    Some(format!("||{}^", domain))
}

/// Drop backslash escapes; `None` if any regex operator remains
fn unescape(regex: &str) -> Option<String> {
    let mut out = String::with_capacity(regex.len());
    let mut chars = regex.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(e) if !e.is_ascii_alphanumeric() => out.push(e),
                _ => return None,
            },
            '[' | ']' | '(' | ')' | '{' | '}' | '+' | '?' | '|' | '^' | '$' => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

/// Convert the literal subset of a regex into an unanchored URL pattern
fn glob_from_regex(regex: &str) -> Option<String> {
    let mut rest = regex.trim();
    let anchor_start = match rest.strip_prefix('^') {
        Some(r) => {
            rest = r;
            true
        }
        None => false,
    };
    let anchor_end = match rest.strip_suffix('$') {
        Some(r) if !r.ends_with('\\') => {
            rest = r;
            true
        }
        _ => false,
    };

    let mut body = String::with_capacity(rest.len());
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(e) if !e.is_ascii_alphanumeric() && !matches!(e, '^' | '|' | '*') => {
                    body.push(e)
                }
                _ => return None,
            },
            '.' if chars.peek() == Some(&'*') => {
                chars.next();
                if !body.ends_with('*') {
                    body.push('*');
                }
            }
            '[' | ']' | '(' | ')' | '{' | '}' | '+' | '?' | '|' | '^' | '$' | '*' => return None,
            c => body.push(c),
        }
    }

    // Leading and trailing wildcards are implied by an unanchored match
    let body = match (anchor_start, anchor_end) {
        (false, false) => body.trim_matches('*'),
        (true, false) => body.trim_end_matches('*'),
        (false, true) => body.trim_start_matches('*'),
        (true, true) => body.as_str(),
    };
    if body.is_empty() || body == "*" {
        return None;
    }
    // After a scheme the host matches exactly, so it has to be complete
    if let Some((_, after)) = body.split_once("://") {
        if !after.contains(['/', '?', '#']) {
            return None;
        }
    }

    let mut pattern = String::with_capacity(body.len() + 2);
    if anchor_start {
        pattern.push('|');
    }
    pattern.push_str(body);
    if anchor_end {
        pattern.push('|');
    }
    Some(pattern)
}
