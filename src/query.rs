//! Deciding whether a query can be answered from the cache.
//!
//! The host describes a finder call with one or more [`QueryOptions`] (typically the call's own options plus any
//! ambient scope) and asks the [`QueryPlanner`] for a [`Plan`]. A query is cacheable when:
//!
//! - no option set carries anything beyond conditions, `readonly == false`, limit, offset and order;
//! - all conditions reduce to attribute equality pairs with non-null values;
//! - a declared index covers exactly the resulting attribute set;
//! - the index order and window are compatible with the requested order and paging.
//!
//! Anything else yields [`Plan::Uncacheable`] and the host answers the query on its own.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::LazyLock;

use fieldx::fxstruct;
use regex::Regex;

use crate::index::IndexSpec;
use crate::key::CacheKey;
use crate::key::COUNT_SUFFIX;
use crate::types::AttrValue;
use crate::types::Order;

const COLUMN: &str = r#"(?:[`"]?(\w+)[`"]?\.)?[`"]?(\w+)[`"]?"#;
const VALUE: &str = r"(-?\d+|\?|'(?:[^']|'')*'|(?i:true|false|null))";

static AND: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\s+AND\s+").expect("AND splitter"));
static KEY_EQ_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^\(?\s*{COLUMN}\s*=\s*{VALUE}\s*\)?$")).expect("equality grammar"));
static ORDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)^\s*{COLUMN}(?:\s+(ASC|DESC))?\s*$")).expect("order grammar"));

/// Query conditions in one of the forms finders accept.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Conditions {
    #[default]
    None,
    /// Attribute to value mapping.
    Map(BTreeMap<String, AttrValue>),
    /// `col = value` fragments joined with `AND`. `?` placeholders take `binds` in order.
    Expression { sql: String, binds: Vec<AttrValue> },
}

impl Conditions {
    pub fn map<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttrValue>,
    {
        Self::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn expression(sql: impl Into<String>, binds: Vec<AttrValue>) -> Self {
        Self::Expression {
            sql: sql.into(),
            binds,
        }
    }

    /// The equality pairs, or `None` if some part of the conditions is not a plain equality.
    pub fn pairs(&self) -> Option<Vec<(String, AttrValue)>> {
        match self {
            Self::None => Some(Vec::new()),
            Self::Map(map) => Some(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Self::Expression { sql, binds } => parse_expression(sql, binds),
        }
    }
}

fn parse_expression(sql: &str, binds: &[AttrValue]) -> Option<Vec<(String, AttrValue)>> {
    let mut binds = binds.iter();
    let mut pairs = Vec::new();
    if sql.trim().is_empty() {
        return binds.next().is_none().then_some(pairs);
    }

    for fragment in AND.split(sql.trim()) {
        let captures = KEY_EQ_VALUE.captures(fragment.trim())?;
        let column = captures.get(2)?.as_str().to_string();
        let raw = captures.get(3)?.as_str();

        let value = if raw == "?" {
            binds.next()?.clone()
        }
        else if let Some(quoted) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            AttrValue::Text(quoted.replace("''", "'"))
        }
        else if raw.eq_ignore_ascii_case("true") {
            AttrValue::Bool(true)
        }
        else if raw.eq_ignore_ascii_case("false") {
            AttrValue::Bool(false)
        }
        else if raw.eq_ignore_ascii_case("null") {
            AttrValue::Null
        }
        else {
            AttrValue::Int(raw.parse().ok()?)
        };
        pairs.push((column, value));
    }

    // Leftover binds mean the expression isn't what it looks like.
    if binds.next().is_some() {
        return None;
    }
    Some(pairs)
}

/// Options of a finder call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    pub conditions: Conditions,
    pub readonly:   bool,
    pub limit:      Option<usize>,
    pub offset:     Option<usize>,
    /// `column [ASC|DESC]`
    pub order:      Option<String>,
    pub joins:      Option<String>,
    pub include:    Vec<String>,
    pub select:     Option<String>,
    pub group:      Option<String>,
    pub lock:       bool,
}

impl QueryOptions {
    pub fn new(conditions: Conditions) -> Self {
        Self {
            conditions,
            ..Default::default()
        }
    }

    /// Shortcut for [`Conditions::map`].
    pub fn filter<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttrValue>,
    {
        Self::new(Conditions::map(pairs))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    /// Nothing but conditions, paging and order.
    pub fn is_cache_safe(&self) -> bool {
        !self.readonly
            && !self.lock
            && self.joins.is_none()
            && self.include.is_empty()
            && self.select.is_none()
            && self.group.is_none()
    }
}

/// Ordering requested by a query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortOrder {
    pub column:    String,
    pub direction: Order,
}

impl SortOrder {
    pub fn new(column: impl Into<String>, direction: Order) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }

    /// The implicit order of a query without an `order` option.
    pub fn primary(primary_key: &str) -> Self {
        Self::new(primary_key, Order::Ascending)
    }

    pub fn parse(sql: &str) -> Option<Self> {
        let captures = ORDER.captures(sql)?;
        let direction = match captures.get(3) {
            Some(dir) if dir.as_str().eq_ignore_ascii_case("desc") => Order::Descending,
            _ => Order::Ascending,
        };
        Some(Self::new(captures.get(2)?.as_str(), direction))
    }
}

/// Aggregations a host may ask for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Calculation {
    /// `None` counts all rows.
    Count(Option<String>),
    Sum(String),
    Average(String),
    Minimum(String),
    Maximum(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UncacheableReason {
    /// Joins, includes, custom select, grouping, locking or `readonly`.
    UnsafeOptions,
    UnparsableConditions,
    UnparsableOrder,
    NullCondition,
    NotIndexed,
    /// An index exists but its order or window can't serve the query.
    IncompatibleIndex,
    UnsupportedCalculation,
}

impl Display for UncacheableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::UnsafeOptions => "options other than conditions, limit, offset and order",
            Self::UnparsableConditions => "conditions are not plain equalities",
            Self::UnparsableOrder => "unrecognized order",
            Self::NullCondition => "null-valued condition",
            Self::NotIndexed => "no index covers the attributes",
            Self::IncompatibleIndex => "index order or window doesn't fit",
            Self::UnsupportedCalculation => "only counting all rows is cached",
        })
    }
}

/// A query answerable from the cache.
#[derive(Clone, Debug, PartialEq)]
#[fxstruct(no_new, default(off))]
pub struct CachePlan {
    #[fieldx(get)]
    key: CacheKey,

    #[fieldx(get)]
    index: IndexSpec,

    #[fieldx(get)]
    order: SortOrder,

    #[fieldx(get(copy))]
    limit: Option<usize>,

    #[fieldx(get(copy))]
    offset: usize,

    operation: Option<&'static str>,
}

impl CachePlan {
    #[inline]
    pub fn is_calculation(&self) -> bool {
        self.operation.is_some()
    }

    /// Logical key of the cached value: the index list, or the calculation result for calculations.
    pub fn cache_key(&self) -> String {
        match self.operation {
            Some(operation) => self.key.with_operation(operation),
            None => self.key.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    Cacheable(CachePlan),
    Uncacheable(UncacheableReason),
}

impl Plan {
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Cacheable(_))
    }

    pub fn cache_key(&self) -> Option<String> {
        match self {
            Self::Cacheable(plan) => Some(plan.cache_key()),
            Self::Uncacheable(_) => None,
        }
    }
}

impl From<Result<CachePlan, UncacheableReason>> for Plan {
    fn from(outcome: Result<CachePlan, UncacheableReason>) -> Self {
        match outcome {
            Ok(plan) => Self::Cacheable(plan),
            Err(reason) => Self::Uncacheable(reason),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QueryPlanner<'a> {
    indices:     &'a [IndexSpec],
    primary_key: &'a str,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(indices: &'a [IndexSpec], primary_key: &'a str) -> Self {
        Self { indices, primary_key }
    }

    pub fn index_for(&self, key: &CacheKey) -> Option<&'a IndexSpec> {
        self.indices.iter().find(|index| index.covers(key))
    }

    pub fn plan(&self, options: &[&QueryOptions]) -> Plan {
        self.resolve(options, None).into()
    }

    pub fn plan_calculation(&self, calculation: &Calculation, options: &[&QueryOptions]) -> Plan {
        match calculation {
            Calculation::Count(None) => self.resolve(options, Some(COUNT_SUFFIX)).into(),
            _ => Plan::Uncacheable(UncacheableReason::UnsupportedCalculation),
        }
    }

    fn resolve(&self, options: &[&QueryOptions], operation: Option<&'static str>) -> Result<CachePlan, UncacheableReason> {
        if !options.iter().all(|o| o.is_cache_safe()) {
            return Err(UncacheableReason::UnsafeOptions);
        }

        let mut pairs = Vec::new();
        for o in options {
            pairs.extend(o.conditions.pairs().ok_or(UncacheableReason::UnparsableConditions)?);
        }
        if pairs.iter().any(|(_, value)| value.is_null()) {
            return Err(UncacheableReason::NullCondition);
        }

        let key = CacheKey::new(pairs);
        let index = self.index_for(&key).ok_or(UncacheableReason::NotIndexed)?;

        let order = match options.iter().find_map(|o| o.order.as_deref()) {
            Some(sql) => SortOrder::parse(sql).ok_or(UncacheableReason::UnparsableOrder)?,
            None => SortOrder::primary(self.primary_key),
        };
        let limit = options.iter().find_map(|o| o.limit);
        let offset = options.iter().find_map(|o| o.offset).unwrap_or(0);

        // Calculations read a counter, not the list, so order and window don't matter. The primary-key index keeps
        // no counters.
        let compatible = match operation {
            Some(_) => !index.is_primary(),
            None => index.matches(&order, self.primary_key, limit, offset),
        };
        if !compatible {
            return Err(UncacheableReason::IncompatibleIndex);
        }

        Ok(CachePlan {
            key,
            index: index.clone(),
            order,
            limit,
            offset,
            operation,
        })
    }
}
