use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::error::CacheError;
use crate::error::Result;

/// A single attribute value of a host record.
///
/// `Null` stands for both SQL `NULL` and an absent attribute. Index keys containing it are not maintained.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttrValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl AttrValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T> From<Option<T>> for AttrValue
where
    T: Into<AttrValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Attribute snapshot of a host entity.
pub type Record = BTreeMap<String, AttrValue>;

/// Build a [`Record`] from `name => value` pairs.
#[macro_export]
macro_rules! record {
    ($($name:expr => $value:expr),* $(,)?) => {{
        let mut record = $crate::types::Record::new();
        $( record.insert(::std::string::ToString::to_string(&$name), $crate::types::AttrValue::from($value)); )*
        record
    }};
}

/// What is stored under a cache key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheValue {
    /// Counters and calculation results.
    Integer(i64),
    /// Lock owner tokens.
    Text(String),
    /// Primary-key references kept by secondary indices.
    References(Vec<AttrValue>),
    /// Full records kept by the primary-key index.
    Records(Vec<Record>),
}

impl CacheValue {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub(crate) fn expect_integer(&self, key: &str) -> Result<i64> {
        self.as_integer().ok_or_else(|| CacheError::UnexpectedValue {
            key:      key.to_string(),
            expected: "an integer",
        })
    }

    pub(crate) fn into_references(self, key: &str) -> Result<Vec<AttrValue>> {
        match self {
            Self::References(refs) => Ok(refs),
            _ => Err(CacheError::UnexpectedValue {
                key:      key.to_string(),
                expected: "a reference list",
            }),
        }
    }

    pub(crate) fn into_records(self, key: &str) -> Result<Vec<Record>> {
        match self {
            Self::Records(records) => Ok(records),
            _ => Err(CacheError::UnexpectedValue {
                key:      key.to_string(),
                expected: "a record list",
            }),
        }
    }
}

/// Sort direction of an index, always applied to the primary key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    #[inline]
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Ascending => ordering,
            Self::Descending => ordering.reverse(),
        }
    }

    pub fn sort<T: Ord>(self, items: &mut [T]) {
        items.sort_by(|a, b| self.apply(a.cmp(b)));
    }
}

impl Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        })
    }
}

/// A host-side mutation, reported after the durable write succeeded.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    Create(Record),
    Update { old: Record, new: Record },
    Delete(Record),
}

/// Outcome of a cache-assisted read.
#[derive(Clone, Debug, PartialEq)]
pub enum Lookup<T> {
    Cached(T),
    /// The host has to answer the query from its backing store.
    Uncacheable(crate::query::UncacheableReason),
}

impl<T> Lookup<T> {
    pub fn cached(self) -> Option<T> {
        match self {
            Self::Cached(v) => Some(v),
            Self::Uncacheable(_) => None,
        }
    }

    #[inline]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}
