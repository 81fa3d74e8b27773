//! Rule data model
//!
//! `Rule` is the declarative, serializable form handed in by the host.
//! `CompiledRule` pairs it with its compiled pattern and is what the
//! store indexes and the engine evaluates.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::StoreError;
use crate::pattern::{is_same_or_subdomain, Pattern};

/// Stable rule identifier, unique within a store
pub type RuleId = u32;

/// Type of resource being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Main or sub frame document
    Document,
    /// JavaScript
    Script,
    /// Image
    Image,
    /// XHR/Fetch request
    #[serde(rename = "xhr", alias = "xmlhttprequest")]
    XmlHttpRequest,
    /// CSS stylesheet
    Stylesheet,
    /// Font
    Font,
    /// Media (video/audio)
    Media,
    /// WebSocket
    WebSocket,
    /// Other/Unknown
    Other,
}

impl ResourceType {
    pub const ALL: [ResourceType; 9] = [
        Self::Document,
        Self::Script,
        Self::Image,
        Self::XmlHttpRequest,
        Self::Stylesheet,
        Self::Font,
        Self::Media,
        Self::WebSocket,
        Self::Other,
    ];

    /// Dense index, used for per-type partitions
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Map a host-supplied label onto a resource type.
    ///
    /// Returns `None` for labels this engine does not know.
    pub fn from_label(label: &str) -> Option<Self> {
        let t = match label.trim().to_ascii_lowercase().as_str() {
            "document" | "main_frame" | "sub_frame" | "subdocument" | "frame" => Self::Document,
            "script" => Self::Script,
            "image" | "imageset" | "img" => Self::Image,
            "xhr" | "xmlhttprequest" | "fetch" => Self::XmlHttpRequest,
            "stylesheet" | "css" => Self::Stylesheet,
            "font" => Self::Font,
            "media" => Self::Media,
            "websocket" => Self::WebSocket,
            "other" | "ping" | "beacon" | "csp_report" | "object" => Self::Other,
            _ => return None,
        };
        Some(t)
    }

    /// Infer from file extension, falling back to the Accept header
    pub fn from_accept_or_path(accept: Option<&str>, path: &str) -> Self {
        let path = path.to_ascii_lowercase();
        let ext = |exts: &[&str]| exts.iter().any(|e| path.ends_with(e));

        if ext(&[".js", ".mjs"]) {
            return Self::Script;
        }
        if ext(&[".css"]) {
            return Self::Stylesheet;
        }
        if ext(&[".woff", ".woff2", ".ttf", ".otf"]) {
            return Self::Font;
        }
        if ext(&[".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico", ".avif"]) {
            return Self::Image;
        }
        if ext(&[".mp4", ".webm", ".mp3", ".ogg", ".m3u8", ".wav"]) {
            return Self::Media;
        }

        if let Some(accept) = accept {
            if accept.contains("text/html") {
                return Self::Document;
            }
            if accept.contains("text/css") {
                return Self::Stylesheet;
            }
            if accept.contains("javascript") {
                return Self::Script;
            }
            if accept.contains("image/") {
                return Self::Image;
            }
            if accept.contains("font/") {
                return Self::Font;
            }
            if accept.contains("application/json") {
                return Self::XmlHttpRequest;
            }
        }

        Self::Other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Script => "script",
            Self::Image => "image",
            Self::XmlHttpRequest => "xhr",
            Self::Stylesheet => "stylesheet",
            Self::Font => "font",
            Self::Media => "media",
            Self::WebSocket => "websocket",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of resource types. Empty means "every type".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResourceTypes(u16);

impl ResourceTypes {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn only(types: &[ResourceType]) -> Self {
        types.iter().copied().collect()
    }

    pub fn insert(&mut self, t: ResourceType) {
        self.0 |= 1 << t.index();
    }

    pub fn remove(&mut self, t: ResourceType) {
        self.0 &= !(1 << t.index());
    }

    /// Whether the set lists `t` explicitly
    pub fn contains(&self, t: ResourceType) -> bool {
        self.0 & (1 << t.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether a rule with this set applies to `t` (empty applies to all)
    #[inline]
    pub fn covers(&self, t: ResourceType) -> bool {
        self.is_empty() || self.contains(t)
    }

    pub fn iter(&self) -> impl Iterator<Item = ResourceType> + '_ {
        ResourceType::ALL.into_iter().filter(|t| self.contains(*t))
    }
}

impl FromIterator<ResourceType> for ResourceTypes {
    fn from_iter<I: IntoIterator<Item = ResourceType>>(iter: I) -> Self {
        let mut set = Self::empty();
        for t in iter {
            set.insert(t);
        }
        set
    }
}

impl Serialize for ResourceTypes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for ResourceTypes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let types = Vec::<ResourceType>::deserialize(deserializer)?;
        Ok(types.into_iter().collect())
    }
}

/// Action to take when a rule matches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    /// Block the request
    Block,
    /// Allow the request (exception rule)
    Allow,
    /// Send the request to another URL
    Redirect { target: String },
}

impl Action {
    pub fn is_allow(&self) -> bool {
        matches!(self, Action::Allow)
    }
}

/// Domains the request must (or must not) originate from
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InitiatorDomains {
    /// If non-empty, the initiator must be one of these or a subdomain
    #[serde(default)]
    pub include: Vec<String>,
    /// The initiator must not be one of these or a subdomain
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl InitiatorDomains {
    fn normalized(&self) -> Self {
        let norm = |list: &[String]| {
            let mut out: Vec<String> = list
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
            out.sort();
            out.dedup();
            out
        };
        Self {
            include: norm(&self.include),
            exclude: norm(&self.exclude),
        }
    }

    /// Check an initiator domain against both lists.
    ///
    /// An include list is never satisfied by a request without initiator.
    pub fn permits(&self, initiator: Option<&str>) -> bool {
        match initiator {
            Some(domain) => {
                let listed = |list: &[String]| list.iter().any(|d| is_same_or_subdomain(domain, d));
                (self.include.is_empty() || listed(&self.include)) && !listed(&self.exclude)
            }
            None => self.include.is_empty(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A declarative filtering rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub action: Action,
    pub pattern: String,
    #[serde(default)]
    pub resource_types: ResourceTypes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_domains: Option<InitiatorDomains>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Rule {
    /// Enabled rule with priority 0 that applies to every resource type
    pub fn new(id: RuleId, action: Action, pattern: impl Into<String>) -> Self {
        Self {
            id,
            action,
            pattern: pattern.into(),
            resource_types: ResourceTypes::empty(),
            initiator_domains: None,
            priority: 0,
            enabled: true,
        }
    }

    pub fn block(id: RuleId, pattern: impl Into<String>) -> Self {
        Self::new(id, Action::Block, pattern)
    }

    pub fn allow(id: RuleId, pattern: impl Into<String>) -> Self {
        Self::new(id, Action::Allow, pattern)
    }

    pub fn redirect(id: RuleId, pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, Action::Redirect { target: target.into() }, pattern)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resource_types(mut self, types: &[ResourceType]) -> Self {
        self.resource_types = ResourceTypes::only(types);
        self
    }

    pub fn with_initiators(mut self, include: &[&str], exclude: &[&str]) -> Self {
        self.initiator_domains = Some(InitiatorDomains {
            include: include.iter().map(|d| d.to_string()).collect(),
            exclude: exclude.iter().map(|d| d.to_string()).collect(),
        });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validate and compile. Errors carry this rule's id.
    pub fn compile(self) -> Result<CompiledRule, StoreError> {
        if let Action::Redirect { target } = &self.action {
            if target.trim().is_empty() {
                return Err(StoreError::MissingRedirectTarget(self.id));
            }
            if Url::parse(target).is_err() {
                return Err(StoreError::InvalidRedirectTarget {
                    id: self.id,
                    target: target.clone(),
                });
            }
        }

        let pattern = Pattern::compile(&self.pattern).map_err(|source| StoreError::Pattern {
            id: self.id,
            source,
        })?;
        let initiators = self
            .initiator_domains
            .as_ref()
            .map(InitiatorDomains::normalized)
            .filter(|d| !d.include.is_empty() || !d.exclude.is_empty());

        Ok(CompiledRule {
            rule: self,
            pattern,
            initiators,
        })
    }
}

/// A validated rule with its pattern compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: Rule,
    pattern: Pattern,
    initiators: Option<InitiatorDomains>,
}

impl CompiledRule {
    #[inline]
    pub fn id(&self) -> RuleId {
        self.rule.id
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.rule.priority
    }

    #[inline]
    pub fn action(&self) -> &Action {
        &self.rule.action
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Full per-request check: enabled, resource type, initiator, then pattern
    pub fn applies_to(
        &self,
        url: &Url,
        resource_type: ResourceType,
        initiator: Option<&str>,
    ) -> bool {
        self.rule.enabled
            && self.rule.resource_types.covers(resource_type)
            && self
                .initiators
                .as_ref()
                .is_none_or(|d| d.permits(initiator))
            && self.pattern.matches(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_json_defaults() {
        let rule: Rule = serde_json::from_str(
            r#"{"id": 7, "action": {"type": "block"}, "pattern": "||ads.com^"}"#,
        )
        .unwrap();
        assert_eq!(rule, Rule::block(7, "||ads.com^"));
        assert!(rule.enabled);
        assert!(rule.resource_types.is_empty());
    }

    #[test]
    fn test_rule_json_full() {
        let rule: Rule = serde_json::from_str(
            r#"{
                "id": 3,
                "action": {"type": "redirect", "target": "https://cdn.local/blank.js"},
                "pattern": "||tracker.net/t.js",
                "resource_types": ["script", "xmlhttprequest"],
                "initiator_domains": {"include": ["news.com"]},
                "priority": 5,
                "enabled": false
            }"#,
        )
        .unwrap();
        assert_eq!(
            rule.action,
            Action::Redirect { target: "https://cdn.local/blank.js".into() }
        );
        assert!(rule.resource_types.contains(ResourceType::Script));
        assert!(rule.resource_types.contains(ResourceType::XmlHttpRequest));
        assert!(!rule.resource_types.contains(ResourceType::Image));
        assert_eq!(rule.priority, 5);
        assert!(!rule.enabled);

        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["resource_types"], serde_json::json!(["script", "xhr"]));
    }

    #[test]
    fn test_redirect_requires_target() {
        let err = Rule::redirect(4, "||x.com^", "  ").compile().unwrap_err();
        assert!(matches!(err, StoreError::MissingRedirectTarget(4)));

        let err = Rule::redirect(5, "||x.com^", "not a url").compile().unwrap_err();
        assert!(matches!(err, StoreError::InvalidRedirectTarget { id: 5, .. }));
    }

    #[test]
    fn test_pattern_error_carries_id() {
        let err = Rule::block(9, "").compile().unwrap_err();
        assert!(matches!(err, StoreError::Pattern { id: 9, .. }));
    }

    #[test]
    fn test_initiator_domains() {
        let domains = InitiatorDomains {
            include: vec!["News.com".into()],
            exclude: vec!["ads.news.com".into()],
        }
        .normalized();

        assert!(domains.permits(Some("news.com")));
        assert!(domains.permits(Some("www.news.com")));
        assert!(!domains.permits(Some("ads.news.com")));
        assert!(!domains.permits(Some("other.com")));
        assert!(!domains.permits(None));

        let exclude_only = InitiatorDomains {
            include: vec![],
            exclude: vec!["shop.com".into()],
        };
        assert!(exclude_only.permits(None));
        assert!(exclude_only.permits(Some("blog.com")));
        assert!(!exclude_only.permits(Some("m.shop.com")));
    }

    #[test]
    fn test_applies_to() {
        let rule = Rule::block(1, "||ads.example.com^")
            .with_resource_types(&[ResourceType::Script])
            .with_initiators(&[], &["example.com"])
            .compile()
            .unwrap();
        let url = Url::parse("https://ads.example.com/a.js").unwrap();

        assert!(rule.applies_to(&url, ResourceType::Script, Some("news.com")));
        assert!(!rule.applies_to(&url, ResourceType::Image, Some("news.com")));
        assert!(!rule.applies_to(&url, ResourceType::Script, Some("www.example.com")));

        let off = Rule::block(2, "||ads.example.com^").disabled().compile().unwrap();
        assert!(!off.applies_to(&url, ResourceType::Script, None));
    }

    #[test]
    fn test_resource_type_labels() {
        assert_eq!(ResourceType::from_label("main_frame"), Some(ResourceType::Document));
        assert_eq!(ResourceType::from_label("XMLHttpRequest"), Some(ResourceType::XmlHttpRequest));
        assert_eq!(ResourceType::from_label("ping"), Some(ResourceType::Other));
        assert_eq!(ResourceType::from_label("speculative"), None);
    }

    #[test]
    fn test_resource_type_detection() {
        assert_eq!(
            ResourceType::from_accept_or_path(None, "/script.js"),
            ResourceType::Script
        );
        assert_eq!(
            ResourceType::from_accept_or_path(None, "/style.css"),
            ResourceType::Stylesheet
        );
        assert_eq!(
            ResourceType::from_accept_or_path(None, "/image.PNG"),
            ResourceType::Image
        );
        assert_eq!(
            ResourceType::from_accept_or_path(Some("text/html"), "/page"),
            ResourceType::Document
        );
        assert_eq!(ResourceType::from_accept_or_path(None, "/page"), ResourceType::Other);
    }
}
