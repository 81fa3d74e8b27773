//! Request Classifier
//!
//! Normalizes raw request metadata from the host into the descriptor the
//! decision engine consumes. No matching happens here.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::ClassificationError;
use crate::pattern::normalized_host;
use crate::rule::ResourceType;

/// Opaque tab / frame context supplied by the host, passed through untouched
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TabContext {
    Id(i64),
    Name(String),
}

impl fmt::Display for TabContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Request metadata as delivered by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    /// Host label such as `script`, `main_frame` or `xmlhttprequest`
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Page URL or domain that triggered the request
    #[serde(default)]
    pub initiator: Option<String>,
    #[serde(default)]
    pub tab_context: Option<TabContext>,
    /// Accept header, only used to infer a missing resource type
    #[serde(default)]
    pub accept: Option<String>,
}

impl RawRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_resource_type(mut self, label: impl Into<String>) -> Self {
        self.resource_type = Some(label.into());
        self
    }

    pub fn with_initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = Some(initiator.into());
        self
    }
}

/// Canonical per-request input to the decision engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    url: Url,
    host: String,
    method: String,
    resource_type: ResourceType,
    initiator_domain: Option<String>,
    tab_context: Option<TabContext>,
}

impl RequestDescriptor {
    /// A GET descriptor with no initiator or tab context
    pub fn new(url: Url, resource_type: ResourceType) -> Self {
        let host = normalized_host(&url)
            .map(|host| host.into_owned())
            .unwrap_or_default();
        Self {
            url,
            host,
            method: "GET".to_string(),
            resource_type,
            initiator_domain: None,
            tab_context: None,
        }
    }

    pub fn with_initiator(mut self, domain: impl Into<String>) -> Self {
        self.initiator_domain = Some(domain.into().to_ascii_lowercase());
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Lowercase host without a trailing root dot, empty for host-less URLs
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn initiator_domain(&self) -> Option<&str> {
        self.initiator_domain.as_deref()
    }

    pub fn tab_context(&self) -> Option<&TabContext> {
        self.tab_context.as_ref()
    }
}

/// Turns raw host requests into descriptors
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    /// Guess the resource type from path / Accept when the host gives no label
    infer_missing_type: bool,
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self {
            infer_missing_type: true,
        }
    }
}

impl RequestClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn infer_missing_type(mut self, enabled: bool) -> Self {
        self.infer_missing_type = enabled;
        self
    }

    /// Fails only when the URL is missing or unparsable; unknown resource
    /// type labels fall back to `Other`.
    pub fn classify(&self, raw: &RawRequest) -> Result<RequestDescriptor, ClassificationError> {
        let text = raw.url.trim();
        if text.is_empty() {
            return Err(ClassificationError::EmptyUrl);
        }
        let url = Url::parse(text).map_err(|source| ClassificationError::InvalidUrl {
            url: text.to_string(),
            source,
        })?;

        let resource_type = match raw.resource_type.as_deref() {
            Some(label) => ResourceType::from_label(label).unwrap_or_else(|| {
                debug!(label, "Unrecognized resource type, classifying as other");
                ResourceType::Other
            }),
            None if self.infer_missing_type => {
                ResourceType::from_accept_or_path(raw.accept.as_deref(), url.path())
            }
            None => ResourceType::Other,
        };

        let method = raw
            .method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| "GET".to_string());

        let mut descriptor = RequestDescriptor::new(url, resource_type);
        descriptor.method = method;
        descriptor.initiator_domain = raw.initiator.as_deref().and_then(initiator_domain);
        descriptor.tab_context = raw.tab_context.clone();
        Ok(descriptor)
    }
}

/// Classify with default settings
pub fn classify(raw: &RawRequest) -> Result<RequestDescriptor, ClassificationError> {
    RequestClassifier::default().classify(raw)
}

/// Domain of an initiator given either as an origin/URL or as a bare domain
fn initiator_domain(initiator: &str) -> Option<String> {
    let initiator = initiator.trim();
    if initiator.is_empty() || initiator == "null" {
        return None;
    }

    if initiator.contains("://") {
        return Url::parse(initiator)
            .ok()?
            .host_str()
            .map(str::to_ascii_lowercase);
    }

    let domain = initiator
        .split(['/', ':'])
        .next()
        .unwrap_or(initiator)
        .trim_matches('.')
        .to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_basic() {
        let raw = RawRequest {
            url: "https://Ads.Example.com/a.js".into(),
            method: Some("post".into()),
            resource_type: Some("script".into()),
            initiator: Some("https://www.news.com/article".into()),
            tab_context: Some(TabContext::Id(42)),
            accept: None,
        };
        let d = classify(&raw).unwrap();
        assert_eq!(d.host(), "ads.example.com");
        assert_eq!(d.method(), "POST");
        assert_eq!(d.resource_type(), ResourceType::Script);
        assert_eq!(d.initiator_domain(), Some("www.news.com"));
        assert_eq!(d.tab_context(), Some(&TabContext::Id(42)));
    }

    #[test]
    fn test_trailing_dot_host() {
        let d = classify(&RawRequest::new("https://Ads.Example.com./a.js")).unwrap();
        assert_eq!(d.host(), "ads.example.com");
        assert_eq!(d.url().host_str(), Some("ads.example.com."));
    }

    #[test]
    fn test_invalid_url() {
        assert_eq!(classify(&RawRequest::new("  ")), Err(ClassificationError::EmptyUrl));
        assert!(matches!(
            classify(&RawRequest::new("not a url")),
            Err(ClassificationError::InvalidUrl { .. })
        ));
        assert!(matches!(
            classify(&RawRequest::new("https://exa mple.com/")),
            Err(ClassificationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_other() {
        let raw = RawRequest::new("https://x.com/a.js").with_resource_type("speculative");
        assert_eq!(classify(&raw).unwrap().resource_type(), ResourceType::Other);
    }

    #[test]
    fn test_missing_type_inferred() {
        let d = classify(&RawRequest::new("https://x.com/app.js")).unwrap();
        assert_eq!(d.resource_type(), ResourceType::Script);

        let d = RequestClassifier::new()
            .infer_missing_type(false)
            .classify(&RawRequest::new("https://x.com/app.js"))
            .unwrap();
        assert_eq!(d.resource_type(), ResourceType::Other);
    }

    #[test]
    fn test_initiator_forms() {
        assert_eq!(initiator_domain("https://News.com:8080/x"), Some("news.com".into()));
        assert_eq!(initiator_domain("news.com"), Some("news.com".into()));
        assert_eq!(initiator_domain("news.com/path"), Some("news.com".into()));
        assert_eq!(initiator_domain("null"), None);
        assert_eq!(initiator_domain(""), None);
    }

    #[test]
    fn test_raw_request_json() {
        let raw: RawRequest = serde_json::from_str(
            r#"{"url": "https://x.com/", "resource_type": "main_frame", "tab_context": "tab-7"}"#,
        )
        .unwrap();
        assert_eq!(raw.tab_context, Some(TabContext::Name("tab-7".into())));
        assert_eq!(classify(&raw).unwrap().resource_type(), ResourceType::Document);
    }
}
