//! Structured queries.
//!
//! Queries are consumed by both the local store and the remote table.
//! The engine never parses query text; it builds and inspects this
//! structured form, and the transport renders it to the wire syntax.

use crate::value::{Item, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved user parameter controlling deleted-record visibility.
///
/// Applications may not set it; the engine owns it during pulls.
pub const INCLUDE_DELETED_PARAMETER: &str = "__includeDeleted";

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// A filter over item properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Filter {
    /// Property equals value.
    Eq(String, Value),
    /// Property is not equal to value.
    Ne(String, Value),
    /// Property is greater than value.
    Gt(String, Value),
    /// Property is greater than or equal to value.
    Ge(String, Value),
    /// Property is less than value.
    Lt(String, Value),
    /// Property is less than or equal to value.
    Le(String, Value),
    /// Property is one of the given values.
    In(String, Vec<Value>),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// Any sub-filter matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// Evaluates the filter against an item.
    ///
    /// Missing properties compare as `Null`; scalar comparisons between
    /// incompatible shapes are false.
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Filter::Eq(name, value) => item.get(name).unwrap_or(&Value::Null) == value,
            Filter::Ne(name, value) => item.get(name).unwrap_or(&Value::Null) != value,
            Filter::Gt(name, value) => Self::compare(item, name, value, |o| o.is_gt()),
            Filter::Ge(name, value) => Self::compare(item, name, value, |o| o.is_ge()),
            Filter::Lt(name, value) => Self::compare(item, name, value, |o| o.is_lt()),
            Filter::Le(name, value) => Self::compare(item, name, value, |o| o.is_le()),
            Filter::In(name, values) => {
                let actual = item.get(name).unwrap_or(&Value::Null);
                values.iter().any(|v| v == actual)
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(item)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(item)),
        }
    }

    fn compare(
        item: &Item,
        name: &str,
        value: &Value,
        check: impl Fn(std::cmp::Ordering) -> bool,
    ) -> bool {
        item.get(name)
            .and_then(|actual| actual.partial_cmp_scalar(value))
            .map(check)
            .unwrap_or(false)
    }

    /// Combines two optional filters with `And`.
    pub fn merge(a: Option<Filter>, b: Option<Filter>) -> Option<Filter> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Filter::And(vec![a, b])),
            (Some(f), None) | (None, Some(f)) => Some(f),
            (None, None) => None,
        }
    }
}

/// A structured query against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Target table.
    pub table: String,
    /// Row filter.
    pub filter: Option<Filter>,
    /// Sort keys, applied in order.
    pub order_by: Vec<(String, SortDirection)>,
    /// Projected columns; empty means all.
    pub select: Vec<String>,
    /// Rows to skip.
    pub skip: Option<u64>,
    /// Maximum rows to return.
    pub top: Option<u64>,
    /// Request a total count alongside the page.
    pub include_total_count: bool,
    /// Include soft-deleted rows.
    pub include_deleted: bool,
    /// Free-form user parameters forwarded to the remote table.
    pub parameters: BTreeMap<String, String>,
}

impl Query {
    /// Creates a query returning every row of a table.
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            filter: None,
            order_by: Vec::new(),
            select: Vec::new(),
            skip: None,
            top: None,
            include_total_count: false,
            include_deleted: false,
            parameters: BTreeMap::new(),
        }
    }

    /// Sets the row filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Appends a sort key.
    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push((column.into(), direction));
        self
    }

    /// Projects the given columns.
    pub fn select(mut self, columns: impl IntoIterator<Item = String>) -> Self {
        self.select.extend(columns);
        self
    }

    /// Skips the first `n` rows.
    pub fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    /// Limits the result to `n` rows.
    pub fn top(mut self, n: u64) -> Self {
        self.top = Some(n);
        self
    }

    /// Includes soft-deleted rows.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Requests the total row count.
    pub fn include_total_count(mut self, include: bool) -> Self {
        self.include_total_count = include;
        self
    }

    /// Adds a user parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Features of the remote query surface a table supports, as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteQueryOptions(u8);

impl RemoteQueryOptions {
    /// No optional features.
    pub const NONE: Self = Self(0);
    /// Server honors `orderby`.
    pub const ORDER_BY: Self = Self(0x01);
    /// Server honors `skip`.
    pub const SKIP: Self = Self(0x02);
    /// Server honors `top`.
    pub const TOP: Self = Self(0x04);
    /// All optional features.
    pub const ALL: Self = Self(0x07);

    /// Returns true if all of `other`'s flags are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns a copy with `other`'s flags added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Result of a local-store read.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    /// Matching rows.
    pub items: Vec<Item>,
    /// Total matching count, when requested.
    pub total_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(json: serde_json::Value) -> Item {
        Item::from_json(json).unwrap()
    }

    #[test]
    fn filter_eq_and_missing_property() {
        let row = item(json!({"id": "a", "count": 3}));
        assert!(Filter::Eq("count".into(), Value::Integer(3)).matches(&row));
        assert!(Filter::Eq("missing".into(), Value::Null).matches(&row));
        assert!(!Filter::Eq("count".into(), Value::Integer(4)).matches(&row));
    }

    #[test]
    fn filter_range_over_timestamps() {
        let row = item(json!({"id": "a", "updatedAt": "2024-06-01T00:00:00Z"}));
        let bound = Value::String("2024-01-01T00:00:00Z".into());
        assert!(Filter::Ge("updatedAt".into(), bound.clone()).matches(&row));
        assert!(!Filter::Lt("updatedAt".into(), bound).matches(&row));
    }

    #[test]
    fn filter_in_and_combinators() {
        let row = item(json!({"id": "a", "state": 1}));
        let f = Filter::And(vec![
            Filter::In("state".into(), vec![Value::Integer(0), Value::Integer(1)]),
            Filter::Or(vec![
                Filter::Eq("id".into(), Value::String("a".into())),
                Filter::Eq("id".into(), Value::String("b".into())),
            ]),
        ]);
        assert!(f.matches(&row));
    }

    #[test]
    fn filter_merge() {
        let a = Filter::Eq("x".into(), Value::Integer(1));
        let b = Filter::Eq("y".into(), Value::Integer(2));
        assert_eq!(Filter::merge(None, None), None);
        assert_eq!(Filter::merge(Some(a.clone()), None), Some(a.clone()));
        assert!(matches!(
            Filter::merge(Some(a), Some(b)),
            Some(Filter::And(v)) if v.len() == 2
        ));
    }

    #[test]
    fn query_builder() {
        let q = Query::table("todos")
            .with_filter(Filter::Eq("done".into(), Value::Bool(false)))
            .order_by("updatedAt", SortDirection::Ascending)
            .top(10)
            .include_deleted(true);
        assert_eq!(q.table, "todos");
        assert_eq!(q.order_by.len(), 1);
        assert_eq!(q.top, Some(10));
        assert!(q.include_deleted);
        assert!(!q.include_total_count);
    }

    #[test]
    fn remote_options_flags() {
        let opts = RemoteQueryOptions::NONE.with(RemoteQueryOptions::TOP);
        assert!(opts.contains(RemoteQueryOptions::TOP));
        assert!(!opts.contains(RemoteQueryOptions::SKIP));
        assert!(RemoteQueryOptions::ALL.contains(opts));
    }
}
