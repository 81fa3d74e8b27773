//! Filter List Import (EasyList Format)
//!
//! Converts Adblock Plus style filter lists into rules.
//! Supports:
//! - Domain anchors: ||example.com^
//! - URL patterns: /ads/*, |https://
//! - Exception rules: @@||allowed.com^
//! - Options: $script,~image,domain=a.com|~b.com,important,redirect=https://...
//!
//! Comments, cosmetic filters (##), regex filters (/.../) and rules with
//! options this engine cannot honor are skipped rather than approximated.

use std::io::{BufRead, BufReader, Read};

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::rule::{Action, InitiatorDomains, ResourceType, ResourceTypes, Rule, RuleId};

/// Errors during filter list parsing
#[derive(Debug, Error)]
pub enum FilterListError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty filter list")]
    EmptyList,

    #[error("Invalid filter config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Priority assigned to `$important` filters so they beat plain exceptions
pub const IMPORTANT_PRIORITY: i32 = 1_000;

/// What one line of a list turned into
#[derive(Debug)]
enum Line {
    Rule(Rule),
    /// Comment or blank
    Ignored,
    /// Valid filter syntax this engine does not evaluate
    Unsupported(&'static str),
    /// Broken filter
    Invalid(String),
}

/// Rules imported from one filter list
#[derive(Debug, Clone)]
pub struct FilterList {
    /// Name of the filter list
    pub name: String,
    pub rules: Vec<Rule>,
    /// Filters skipped as unsupported (cosmetic, regex, unknown options)
    pub unsupported: usize,
    /// Filters that failed to parse
    pub invalid: usize,
}

impl FilterList {
    /// Parse a filter list, numbering rules from `first_id`
    pub fn parse<R: Read>(name: &str, reader: R, first_id: RuleId) -> Result<Self, FilterListError> {
        let buf_reader = BufReader::new(reader);
        let mut list = Self {
            name: name.to_string(),
            rules: Vec::new(),
            unsupported: 0,
            invalid: 0,
        };
        let mut line_count = 0;
        let mut next_id = first_id;

        for line in buf_reader.lines() {
            let line = line?;
            line_count += 1;

            match parse_line(&line, next_id) {
                Line::Rule(rule) => {
                    list.rules.push(rule);
                    next_id = next_id.saturating_add(1);
                }
                Line::Ignored => {}
                Line::Unsupported(why) => {
                    debug!("Skipping filter '{}': {}", line.trim(), why);
                    list.unsupported += 1;
                }
                Line::Invalid(why) => {
                    warn!("{}:{}: invalid filter '{}': {}", name, line_count, line.trim(), why);
                    list.invalid += 1;
                }
            }
        }

        if list.rules.is_empty() {
            return Err(FilterListError::EmptyList);
        }

        info!(
            "Parsed filter list '{}': {} lines, {} rules ({} block, {} exception), {} unsupported, {} invalid",
            name,
            line_count,
            list.rules.len(),
            list.rules.iter().filter(|r| !r.action.is_allow()).count(),
            list.rules.iter().filter(|r| r.action.is_allow()).count(),
            list.unsupported,
            list.invalid
        );

        Ok(list)
    }

    /// Block rules for a built-in set of well-known tracking domains
    pub fn tracking_defaults(first_id: RuleId) -> Self {
        let rules = default_tracking_domains()
            .into_iter()
            .zip(first_id..)
            .map(|(domain, id)| Rule::block(id, format!("||{}^", domain)))
            .collect();
        Self {
            name: "tracking-defaults".to_string(),
            rules,
            unsupported: 0,
            invalid: 0,
        }
    }

    /// Number of rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn parse_line(line: &str, id: RuleId) -> Line {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('[') {
        return Line::Ignored;
    }
    if ["##", "#@#", "#?#", "#$#"].iter().any(|m| trimmed.contains(m)) {
        return Line::Unsupported("cosmetic filter");
    }

    // Exception rule: @@||domain.com^
    let (action, filter) = match trimmed.strip_prefix("@@") {
        Some(rest) => (Action::Allow, rest),
        None => (Action::Block, trimmed),
    };

    let (pattern, options) = match filter.rfind('$') {
        Some(pos) if !filter[pos + 1..].contains('/') || filter[pos + 1..].contains('=') => {
            (&filter[..pos], Some(&filter[pos + 1..]))
        }
        _ => (filter, None),
    };

    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        return Line::Unsupported("regex filter");
    }

    let mut rule = Rule::new(id, action, if pattern.is_empty() { "*" } else { pattern });

    if let Some(options) = options {
        if let Err(outcome) = apply_options(&mut rule, options) {
            return outcome;
        }
    }

    match rule.clone().compile() {
        Ok(_) => Line::Rule(rule),
        Err(e) => Line::Invalid(e.to_string()),
    }
}

fn apply_options(rule: &mut Rule, options: &str) -> Result<(), Line> {
    let mut types = ResourceTypes::empty();
    let mut negated = ResourceTypes::empty();
    let mut domains = InitiatorDomains::default();

    for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        if option == "important" {
            rule.priority = IMPORTANT_PRIORITY;
        } else if let Some(list) = option.strip_prefix("domain=") {
            for domain in list.split('|').filter(|d| !d.is_empty()) {
                match domain.strip_prefix('~') {
                    Some(excluded) => domains.exclude.push(excluded.to_string()),
                    None => domains.include.push(domain.to_string()),
                }
            }
        } else if let Some(target) = option.strip_prefix("redirect=") {
            if rule.action.is_allow() {
                return Err(Line::Unsupported("redirect on exception"));
            }
            if Url::parse(target).is_err() {
                return Err(Line::Unsupported("named redirect resource"));
            }
            rule.action = Action::Redirect {
                target: target.to_string(),
            };
        } else if let Some(label) = option.strip_prefix('~') {
            match ResourceType::from_label(label) {
                Some(t) => negated.insert(t),
                None => return Err(Line::Unsupported("unknown option")),
            }
        } else {
            match ResourceType::from_label(option) {
                Some(t) => types.insert(t),
                None => return Err(Line::Unsupported("unknown option")),
            }
        }
    }

    if !negated.is_empty() {
        let mut effective = if types.is_empty() {
            ResourceType::ALL.into_iter().collect()
        } else {
            types
        };
        for t in negated.iter() {
            effective.remove(t);
        }
        if effective.is_empty() {
            return Err(Line::Invalid("options exclude every resource type".to_string()));
        }
        types = effective;
    }

    rule.resource_types = types;
    if !domains.include.is_empty() || !domains.exclude.is_empty() {
        rule.initiator_domains = Some(domains);
    }
    Ok(())
}

/// Well-known tracking domains
pub fn default_tracking_domains() -> Vec<&'static str> {
    vec![
        // Google Ads/Analytics
        "doubleclick.net",
        "googlesyndication.com",
        "googleadservices.com",
        "google-analytics.com",
        "googletagmanager.com",
        "googletagservices.com",
        // Facebook
        "connect.facebook.net",
        "pixel.facebook.com",
        // Twitter/X
        "ads-twitter.com",
        "analytics.twitter.com",
        // Amazon
        "amazon-adsystem.com",
        // Generic trackers
        "adnxs.com",
        "adsrvr.org",
        "criteo.com",
        "criteo.net",
        "outbrain.com",
        "taboola.com",
        "quantserve.com",
        "scorecardresearch.com",
        "hotjar.com",
        "mixpanel.com",
        "segment.io",
        "amplitude.com",
        "moat.com",
        "chartbeat.com",
    ]
}
