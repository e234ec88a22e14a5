//! Deterministic cache keys.
//!
//! A key is built from `(attribute, value)` equality pairs sorted by attribute name, so its wire form depends only on
//! the *set* of conditions: `{title: "Foo", story_id: 7}` and `{story_id: 7, title: "Foo"}` both become
//! `story_id/7/title/Foo`.

use std::fmt::Display;

use crate::types::AttrValue;

pub const SEPARATOR: char = '/';
pub const COUNT_SUFFIX: &str = "count";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pairs: Vec<(String, AttrValue)>,
}

impl CacheKey {
    pub fn new<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, AttrValue)>,
        K: Into<String>,
    {
        let mut pairs = pairs.into_iter().map(|(k, v)| (k.into(), v)).collect::<Vec<_>>();
        // Values take part in the ordering only to keep duplicate attribute names deterministic.
        pairs.sort();
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, AttrValue)] {
        &self.pairs
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    /// Keys with a null value are never written through: nullable indexed attributes are not maintained.
    pub fn is_writable(&self) -> bool {
        !self.pairs.iter().any(|(_, v)| v.is_null())
    }

    /// The shadow counter tracking the true number of matching records.
    pub fn count_key(&self) -> String {
        self.with_operation(COUNT_SUFFIX)
    }

    pub fn with_operation(&self, operation: &str) -> String {
        format!("{self}{SEPARATOR}{operation}")
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, (name, value)) in self.pairs.iter().enumerate() {
            if idx > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            write!(f, "{name}{SEPARATOR}{value}")?;
        }
        Ok(())
    }
}

/// Compose the backend key: `<namespace>[:<version>]/<key>`, with spaces in the key replaced by `+`.
pub fn namespaced(namespace: &str, version: u32, key: &str) -> String {
    let key = key.replace(' ', "+");
    if version > 0 {
        format!("{namespace}:{version}{SEPARATOR}{key}")
    }
    else {
        format!("{namespace}{SEPARATOR}{key}")
    }
}
