//! Pattern Matcher
//!
//! Compiles URL filter patterns into a matchable form once per rule.
//! Supports:
//! - Domain anchor: `||example.com^` (the host or any subdomain)
//! - Scheme prefix: `https://example.com/path`, `*://*.example.com/*`
//! - Host wildcards: `*.example.com`, `example.*`
//! - Path wildcard `*` and separator placeholder `^` (one of `/ ? # :` or end)
//! - Start / end anchors: `|https://cdn.`, `.js|`
//!
//! Hosts compare case-insensitively, everything after the host compares
//! case-sensitively. Unicode hosts are compiled to punycode.
//!
//! Matching never backtracks across wildcard segments: each fixed segment
//! is located leftmost-first and never revisited. Locating one segment is a
//! naive scan, so a match costs at most URL length times the longest fixed
//! segment, not strictly linear time. Segments in real filters are short.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;

use thiserror::Error;
use url::{Host, Position, Url};

/// Errors raised while compiling a pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,

    #[error("pattern has an empty host")]
    EmptyHost,

    #[error("unsupported wildcard in host '{0}'")]
    HostWildcard(String),

    #[error("repeated wildcard '**'")]
    RepeatedWildcard,

    #[error("misplaced anchor '|'")]
    MisplacedAnchor,

    #[error("invalid scheme '{0}'")]
    InvalidScheme(String),

    #[error("invalid host '{0}'")]
    InvalidHost(String),
}

/// One position in a compiled segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Byte(u8),
    /// `^`: one of `/ ? # :`, or the end of input (zero width)
    Separator,
}

#[inline]
fn is_separator(b: u8) -> bool {
    matches!(b, b'/' | b'?' | b'#' | b':')
}

/// Wildcard body: fixed segments separated by `*`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Glob {
    /// Always holds at least one (possibly empty) segment
    segments: Vec<Vec<Token>>,
    anchor_start: bool,
    anchor_end: bool,
}

impl Glob {
    fn compile(body: &str, anchor_start: bool, anchor_end: bool) -> Result<Self, PatternError> {
        if body.contains("**") {
            return Err(PatternError::RepeatedWildcard);
        }
        if body.contains('|') {
            return Err(PatternError::MisplacedAnchor);
        }

        let segments = body
            .split('*')
            .map(|seg| {
                seg.bytes()
                    .map(|b| if b == b'^' { Token::Separator } else { Token::Byte(b) })
                    .collect()
            })
            .collect();

        Ok(Self {
            segments,
            anchor_start,
            anchor_end,
        })
    }

    fn matches(&self, text: &Text<'_>) -> bool {
        let len = text.len();
        let last = self.segments.len() - 1;
        let mut pos = 0;

        for (i, seg) in self.segments.iter().enumerate() {
            let pinned_start = i == 0 && self.anchor_start;

            if i == last && self.anchor_end {
                if pinned_start {
                    return match_at(seg, text, 0) == Some(len);
                }
                return (pos..=len).any(|s| match_at(seg, text, s) == Some(len));
            }

            let end = if pinned_start {
                match_at(seg, text, 0)
            } else {
                find(seg, text, pos)
            };

            match end {
                Some(e) => pos = e,
                None => return false,
            }
        }

        true
    }
}

/// Input of a glob. Bytes inside `host` compare case-insensitively.
struct Text<'a> {
    bytes: &'a [u8],
    host: Range<usize>,
}

impl<'a> Text<'a> {
    /// Text with no host span: every byte compares exactly
    fn exact(bytes: &'a [u8]) -> Self {
        Self { bytes, host: 0..0 }
    }

    #[inline]
    fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    fn get(&self, i: usize) -> Option<u8> {
        self.bytes.get(i).copied()
    }

    #[inline]
    fn byte_matches(&self, i: usize, b: u8) -> bool {
        match self.get(i) {
            Some(c) if self.host.contains(&i) => c.eq_ignore_ascii_case(&b),
            Some(c) => c == b,
            None => false,
        }
    }
}

/// Match `seg` starting exactly at `start`, returning the end offset
#[inline]
fn match_at(seg: &[Token], text: &Text<'_>, start: usize) -> Option<usize> {
    let mut i = start;
    for tok in seg {
        match *tok {
            Token::Byte(b) => {
                if !text.byte_matches(i, b) {
                    return None;
                }
                i += 1;
            }
            Token::Separator => match text.get(i) {
                Some(c) if is_separator(c) => i += 1,
                Some(_) => return None,
                None => {}
            },
        }
    }
    Some(i)
}

/// Leftmost occurrence of `seg` at or after `from`, returning its end offset
fn find(seg: &[Token], text: &Text<'_>, from: usize) -> Option<usize> {
    let first = match seg.first() {
        None => return Some(from),
        Some(tok) => *tok,
    };

    (from..=text.len())
        .filter(|&s| match first {
            Token::Byte(b) => text.byte_matches(s, b),
            Token::Separator => true,
        })
        .find_map(|s| match_at(seg, text, s))
}

/// Host part of a host-qualified pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatch {
    /// `*`
    Any,
    /// `example.com` after an explicit scheme
    Exact(String),
    /// `||example.com` or `*.example.com`: the host or any subdomain
    Domain(String),
    /// `example.*` after an explicit scheme; stored with the trailing dot
    Prefix(String),
    /// `||example.*`: `example.` at any label boundary; stored with the trailing dot
    DomainPrefix(String),
}

impl HostMatch {
    fn parse(raw: &str, domain_anchor: bool) -> Result<Self, PatternError> {
        let host = raw.to_ascii_lowercase();
        if host.is_empty() {
            return Err(PatternError::EmptyHost);
        }
        if host == "*" {
            return Ok(Self::Any);
        }

        if let Some(rest) = host.strip_prefix("*.") {
            if rest.is_empty() || rest.contains('*') {
                return Err(PatternError::HostWildcard(raw.to_string()));
            }
            return Ok(Self::Domain(ascii_host(rest, raw)?));
        }

        if let Some(prefix) = host.strip_suffix(".*") {
            if prefix.is_empty() || prefix.contains('*') {
                return Err(PatternError::HostWildcard(raw.to_string()));
            }
            let prefix = format!("{}.", ascii_host(prefix, raw)?);
            return Ok(if domain_anchor {
                Self::DomainPrefix(prefix)
            } else {
                Self::Prefix(prefix)
            });
        }

        if host.contains('*') {
            return Err(PatternError::HostWildcard(raw.to_string()));
        }

        let host = ascii_host(&host, raw)?;
        Ok(if domain_anchor {
            Self::Domain(host)
        } else {
            Self::Exact(host)
        })
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(h) => host == h,
            Self::Domain(d) => is_same_or_subdomain(host, d),
            Self::Prefix(p) => host.len() > p.len() && host.starts_with(p.as_str()),
            Self::DomainPrefix(p) => label_starts(host).any(|i| {
                let rest = &host[i..];
                rest.len() > p.len() && rest.starts_with(p.as_str())
            }),
        }
    }

    fn fixed_suffix(&self) -> Option<&str> {
        match self {
            Self::Exact(h) | Self::Domain(h) => Some(h),
            Self::Any | Self::Prefix(_) | Self::DomainPrefix(_) => None,
        }
    }
}

/// Lowercase ASCII form of a wildcard-free host fragment.
///
/// Request hosts arrive IDNA-encoded from `url`, so Unicode names are
/// converted to punycode here. A trailing root dot is dropped.
fn ascii_host(name: &str, raw: &str) -> Result<String, PatternError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return Err(PatternError::EmptyHost);
    }
    if name.is_ascii() {
        return Ok(name.to_ascii_lowercase());
    }
    match Host::parse(name) {
        Ok(Host::Domain(ascii)) => Ok(ascii),
        _ => Err(PatternError::InvalidHost(raw.to_string())),
    }
}

/// Request host as matched against rules: lowercase, without a trailing root dot
pub(crate) fn normalized_host(url: &Url) -> Option<Cow<'_, str>> {
    let host = url.host_str()?;
    let host = host.strip_suffix('.').unwrap_or(host);
    Some(if host.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(host.to_ascii_lowercase())
    } else {
        Cow::Borrowed(host)
    })
}

/// Offsets at which a label of `host` begins
fn label_starts(host: &str) -> impl Iterator<Item = usize> + '_ {
    std::iter::once(0).chain(host.match_indices('.').map(|(i, _)| i + 1))
}

/// True when `host` equals `domain` or is one of its subdomains.
///
/// Both sides must already be lowercase.
pub(crate) fn is_same_or_subdomain(host: &str, domain: &str) -> bool {
    if host.len() == domain.len() {
        return host == domain;
    }
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    /// No host part: the glob runs over the whole serialized URL
    Url(Glob),
    /// Scheme and host checked structurally, glob runs over what follows the host
    Host {
        scheme: Option<String>,
        host: HostMatch,
        body: Glob,
    },
}

/// A compiled URL pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    kind: PatternKind,
}

impl Pattern {
    /// Compile a pattern. Fails on empty input and malformed wildcard or anchor usage.
    pub fn compile(source: &str) -> Result<Self, PatternError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }

        let kind = if let Some(rest) = trimmed.strip_prefix("||") {
            Self::compile_host(None, rest, true)?
        } else {
            let (anchor_start, rest) = match trimmed.strip_prefix('|') {
                Some(rest) => (true, rest),
                None => (false, trimmed),
            };

            match rest.split_once("://") {
                Some((scheme, after)) if is_scheme(scheme) => {
                    let scheme = (scheme != "*").then(|| scheme.to_ascii_lowercase());
                    Self::compile_host(scheme, after, false)?
                }
                Some((scheme, _)) if scheme.contains('*') && !scheme.contains('/') => {
                    return Err(PatternError::InvalidScheme(scheme.to_string()));
                }
                _ if !anchor_start && (rest.starts_with("*.") || has_prefix_host(rest)) => {
                    Self::compile_host(None, rest, false)?
                }
                _ => {
                    let (body, anchor_end) = strip_end_anchor(rest);
                    if body.is_empty() {
                        return Err(PatternError::MisplacedAnchor);
                    }
                    PatternKind::Url(Glob::compile(body, anchor_start, anchor_end)?)
                }
            }
        };

        Ok(Self {
            source: trimmed.to_string(),
            kind,
        })
    }

    fn compile_host(
        scheme: Option<String>,
        rest: &str,
        domain_anchor: bool,
    ) -> Result<PatternKind, PatternError> {
        let split = rest
            .find(|c| matches!(c, '/' | '^' | '?' | '#' | ':' | '|'))
            .unwrap_or(rest.len());
        let (host, body) = rest.split_at(split);
        let host = HostMatch::parse(host, domain_anchor)?;
        let (body, anchor_end) = strip_end_anchor(body);

        Ok(PatternKind::Host {
            scheme,
            host,
            body: Glob::compile(body, true, anchor_end)?,
        })
    }

    /// Check whether `url` matches this pattern
    pub fn matches(&self, url: &Url) -> bool {
        match &self.kind {
            PatternKind::Url(glob) => {
                let host = url[..Position::BeforeHost].len()..url[..Position::AfterHost].len();
                glob.matches(&Text {
                    bytes: url.as_str().as_bytes(),
                    host,
                })
            }
            PatternKind::Host { scheme, host, body } => {
                if let Some(scheme) = scheme {
                    if url.scheme() != scheme {
                        return false;
                    }
                }

                let Some(url_host) = normalized_host(url) else {
                    return false;
                };

                host.matches(&url_host)
                    && body.matches(&Text::exact(url[Position::AfterHost..].as_bytes()))
            }
        }
    }

    /// Longest fixed (wildcard-free) suffix of the host part, used as the index key
    pub fn host_key(&self) -> Option<&str> {
        match &self.kind {
            PatternKind::Host { host, .. } => host.fixed_suffix(),
            PatternKind::Url(_) => None,
        }
    }

    /// The pattern as written (trimmed)
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Evaluate a compiled pattern against a URL
#[inline]
pub fn matches(pattern: &Pattern, url: &Url) -> bool {
    pattern.matches(url)
}

fn strip_end_anchor(body: &str) -> (&str, bool) {
    match body.strip_suffix('|') {
        Some(body) => (body, true),
        None => (body, false),
    }
}

/// Scheme-less `label.*` host prefix, optionally followed by a path part
fn has_prefix_host(rest: &str) -> bool {
    let end = rest
        .find(|c| matches!(c, '/' | '^' | '?' | '#' | ':' | '|'))
        .unwrap_or(rest.len());
    let host = &rest[..end];
    host.strip_suffix(".*").is_some_and(|prefix| {
        !prefix.is_empty() && !prefix.starts_with(['.', '*'])
    })
}

fn is_scheme(s: &str) -> bool {
    if s == "*" {
        return true;
    }
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn hit(pattern: &str, u: &str) -> bool {
        Pattern::compile(pattern).unwrap().matches(&url(u))
    }

    #[test]
    fn test_domain_anchor() {
        assert!(hit("||ads.example.com^", "https://ads.example.com/a.js"));
        assert!(hit("||ads.example.com^", "https://ads.example.com"));
        assert!(hit("||ads.example.com^", "http://cdn.ads.example.com:8080/x"));
        assert!(!hit("||ads.example.com^", "https://notads.example.com/a.js"));
        assert!(!hit("||ads.example.com^", "https://example.com/ads.example.com"));
    }

    #[test]
    fn test_domain_anchor_with_path() {
        let p = "||ads.example.com/allowed.js";
        assert!(hit(p, "https://ads.example.com/allowed.js"));
        assert!(hit(p, "https://ads.example.com/allowed.js?v=2"));
        assert!(!hit(p, "https://ads.example.com/other.js"));
        assert!(!hit(p, "https://ads.example.com/x/allowed.js"));
    }

    #[test]
    fn test_host_case_insensitive_path_case_sensitive() {
        assert!(hit("||EXAMPLE.com/Ads", "https://example.com/Ads"));
        assert!(!hit("||example.com/Ads", "https://example.com/ads"));
    }

    #[test]
    fn test_scheme_prefix() {
        assert!(hit("https://example.com/login", "https://example.com/login"));
        assert!(!hit("https://example.com/login", "http://example.com/login"));
        assert!(!hit("https://example.com/login", "https://www.example.com/login"));
        assert!(hit("*://example.com/*", "wss://example.com/socket"));
        assert!(hit("|https://example.com/", "https://example.com/x"));
    }

    #[test]
    fn test_host_wildcards() {
        assert!(hit("*.example.com/img", "https://cdn.example.com/img.png"));
        assert!(hit("*.example.com/img", "https://example.com/img"));
        assert!(!hit("*.example.com/img", "https://badexample.com/img"));

        assert!(hit("https://example.*/", "https://example.org/"));
        assert!(!hit("https://example.*/", "https://www.example.org/"));

        assert!(hit("||tracker.*^", "https://eu.tracker.co.uk/p"));
        assert!(!hit("||tracker.*^", "https://mytracker.com/p"));

        assert!(hit("*://*/beacon", "https://anything.net/beacon"));
    }

    #[test]
    fn test_generic_patterns() {
        assert!(hit("/ads/*", "https://news.com/ads/banner.png"));
        assert!(!hit("/ads/*", "https://news.com/uploads/banner.png"));
        assert!(hit("/banner*.gif", "https://x.com/img/banner_728.gif"));
        assert!(hit("*", "https://x.com/"));
    }

    #[test]
    fn test_separator_placeholder() {
        assert!(hit("/track^", "https://x.com/track?id=1"));
        assert!(hit("/track^", "https://x.com/track"));
        assert!(hit("/track^", "https://x.com/track/"));
        assert!(!hit("/track^", "https://x.com/tracker"));
        assert!(hit("||example.com^", "https://example.com:8443/"));
    }

    #[test]
    fn test_end_anchor() {
        assert!(hit(".js|", "https://x.com/app.js"));
        assert!(!hit(".js|", "https://x.com/app.js?x=1"));
        assert!(hit("|https://x.com/app.js|", "https://x.com/app.js"));
        assert!(!hit("|https://x.com/app.js|", "https://x.com/app.json"));
        assert!(hit("/a*b|", "https://x.com/a/b/a/b"));
    }

    #[test]
    fn test_leftmost_segments() {
        assert!(hit("/a/*/c/*/e", "https://x.com/a/b/c/d/e"));
        assert!(hit("/a/*/c/*/e", "https://x.com/a/c/c/c/x/e"));
        assert!(!hit("/a/*/c/*/e", "https://x.com/a/b/e/c/"));
    }

    #[test]
    fn test_compile_errors() {
        assert_eq!(Pattern::compile(""), Err(PatternError::Empty));
        assert_eq!(Pattern::compile("   "), Err(PatternError::Empty));
        assert_eq!(Pattern::compile("||"), Err(PatternError::EmptyHost));
        assert_eq!(Pattern::compile("||^"), Err(PatternError::EmptyHost));
        assert_eq!(Pattern::compile("/ads/**"), Err(PatternError::RepeatedWildcard));
        assert_eq!(Pattern::compile("a|b"), Err(PatternError::MisplacedAnchor));
        assert_eq!(Pattern::compile("|"), Err(PatternError::MisplacedAnchor));
        assert!(matches!(
            Pattern::compile("||ex*ample.com"),
            Err(PatternError::HostWildcard(_))
        ));
        assert!(matches!(
            Pattern::compile("*.*"),
            Err(PatternError::HostWildcard(_))
        ));
        assert!(matches!(
            Pattern::compile("ht*p://example.com/"),
            Err(PatternError::InvalidScheme(_))
        ));
    }

    #[test]
    fn test_host_key() {
        let key = |p: &str| Pattern::compile(p).unwrap().host_key().map(str::to_string);
        assert_eq!(key("||Ads.Example.com^").as_deref(), Some("ads.example.com"));
        assert_eq!(key("*.example.com/x").as_deref(), Some("example.com"));
        assert_eq!(key("https://cdn.net/").as_deref(), Some("cdn.net"));
        assert_eq!(key("||example.*"), None);
        assert_eq!(key("/ads/"), None);
    }

    #[test]
    fn test_trailing_dot_host() {
        assert!(hit("||ads.example.com^", "https://ads.example.com./a.js"));
        assert!(hit("||example.com.^", "https://cdn.example.com/x"));
        assert!(hit("https://example.com/login", "https://example.com./login"));
        assert!(!hit("||ads.example.com^", "https://ads.example.com.evil.net/"));
    }

    #[test]
    fn test_schemeless_host_prefix() {
        assert!(hit("example.*", "https://example.org/"));
        assert!(hit("example.*/ads/", "http://example.co.uk/ads/x.js"));
        assert!(!hit("example.*", "https://news.com/example.html"));
        assert!(!hit("example.*", "https://www.example.org/"));
        assert!(!hit("example.*/ads/", "https://example.org/news/"));
        assert_eq!(
            Pattern::compile("ex*ample.*"),
            Err(PatternError::HostWildcard("ex*ample.*".into()))
        );
    }

    #[test]
    fn test_generic_pattern_host_case() {
        assert!(hit("Ads.Example.com^", "https://ads.example.com/x"));
        assert!(hit("*Example.COM/x", "https://ads.example.com/x"));
        // Only the host span folds case
        assert!(!hit("example.com/Ads", "https://example.com/ads"));
    }

    #[test]
    fn test_unicode_host() {
        let p = Pattern::compile("||bücher.de^").unwrap();
        assert_eq!(p.host_key(), Some("xn--bcher-kva.de"));
        assert!(p.matches(&url("https://bücher.de/")));
        assert!(p.matches(&url("https://shop.xn--bcher-kva.de/x")));
        assert!(!p.matches(&url("https://bucher.de/")));

        assert!(hit("https://BÜCHER.*/", "https://bücher.com/"));
        assert!(matches!(
            Pattern::compile("||bü<r.de^"),
            Err(PatternError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_long_repetitive_url() {
        let path = "a".repeat(4_000);
        let target = format!("https://x.com/{}b", path);
        assert!(hit("/aaaaaaaaab", &target));
        assert!(hit("*aaaa*aaab|", &target));
        assert!(!hit("/aaaaaaaaac", &target));
    }

    #[test]
    fn test_subdomain_helper() {
        assert!(is_same_or_subdomain("example.com", "example.com"));
        assert!(is_same_or_subdomain("a.b.example.com", "example.com"));
        assert!(!is_same_or_subdomain("badexample.com", "example.com"));
        assert!(!is_same_or_subdomain("com", "example.com"));
    }
}
