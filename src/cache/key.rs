//! Cache keys and invalidation patterns.
//!
//! A [`CacheKey`] is derived deterministically from a [`FeedQuery`]: the
//! namespace comes first so that whole groups of feeds can be dropped with a
//! single [`KeyPattern`].
//!
//! Every caller-supplied segment is percent-encoded for the characters that
//! delimit the key (`:`, `&`, `=`, `#` and `%` itself), so distinct queries
//! never compose to the same key.

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, PercentEncode, CONTROLS};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::fetch::page::Cursor;

/// Characters escaped inside one key segment.
const SEGMENT_SET: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b':')
    .add(b'&')
    .add(b'=')
    .add(b'#');

fn escape(segment: &str) -> PercentEncode<'_> {
    utf8_percent_encode(segment, SEGMENT_SET)
}

/// Sort direction of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => write!(f, "asc"),
            SortOrder::Desc => write!(f, "desc"),
        }
    }
}

/// A logical feed request as issued by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedQuery {
    /// Logical namespace, e.g. `movies` or `continue-watching`.
    pub namespace: String,

    /// Field the feed is sorted by.
    pub sort_key: String,

    pub sort_order: SortOrder,

    /// Items requested per page.
    pub page_size: u32,

    /// Extra filters. Ordered so key derivation is stable.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl FeedQuery {
    pub fn new(
        namespace: impl Into<String>,
        sort_key: impl Into<String>,
        sort_order: SortOrder,
        page_size: u32,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            sort_key: sort_key.into(),
            sort_order,
            page_size,
            filters: BTreeMap::new(),
        }
    }

    /// Add a filter, builder style.
    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(name.into(), value.into());
        self
    }

    /// Derive the cache key for this query.
    ///
    /// ```text
    /// movies:id:desc:20:genre=drama&year=2020
    /// ```
    pub fn cache_key(&self) -> CacheKey {
        let filters = self
            .filters
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join("&");
        CacheKey(format!(
            "{}:{}:{}:{}:{}",
            escape(&self.namespace),
            escape(&self.sort_key),
            self.sort_order,
            self.page_size,
            filters
        ))
    }
}

/// Opaque, deterministic cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-composed key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace segment (everything before the first `:`), as escaped in
    /// the key.
    pub fn namespace(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// Key of one cached page of this feed.
    pub fn page(&self, cursor: Cursor) -> CacheKey {
        CacheKey(format!("{}#page={}", self.0, cursor))
    }

    /// Pattern matching every cached page of this feed.
    pub fn pages_pattern(&self) -> KeyPattern {
        KeyPattern::Prefix(format!("{}#page=", self.0))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> String {
        key.0
    }
}

/// Selects a group of keys for bulk invalidation.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Keys starting with the given string.
    Prefix(String),
    /// Keys matched by a regular expression.
    Regex(Regex),
}

impl KeyPattern {
    /// Compile a regex pattern.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(KeyPattern::Regex(Regex::new(pattern)?))
    }

    /// Pattern covering every key (feed and page) in the given namespaces.
    ///
    /// Returns `None` when `namespaces` is empty.
    pub fn namespaces<S: AsRef<str>>(namespaces: &[S]) -> Option<Self> {
        if namespaces.is_empty() {
            return None;
        }
        let alternation = namespaces
            .iter()
            .map(|ns| regex::escape(&escape(ns.as_ref()).to_string()))
            .collect::<Vec<_>>()
            .join("|");
        // Escaped literals always form a valid expression.
        Regex::new(&format!("^(?:{alternation}):"))
            .ok()
            .map(KeyPattern::Regex)
    }

    /// Pattern covering one namespace.
    pub fn namespace(namespace: &str) -> Self {
        KeyPattern::Prefix(format!("{}:", escape(namespace)))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Regex(re) => re.is_match(key),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            KeyPattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}
