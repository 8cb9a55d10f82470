//! Event store abstraction.
//!
//! The event store is a generic keyed record store. Records are JSON objects
//! addressed by a [`RecordKey`] (kind + name) and can be queried by simple
//! field filters with an optional ordering and limit.
//!
//! ## Contract
//!
//! - `get` returns [`Error::NotFound`] when the key is absent
//! - `put` is last-write-wins on the key and returns the key
//! - `delete` succeeds even if the record doesn't exist (idempotent)
//! - `query` returns a lazy, single-pass stream; it cannot be restarted
//! - `count` counts matches without materialising them
//!
//! ```rust
//! use vitals_core::store::{Filter, Kind, Order, Query};
//!
//! let query = Query::new(Kind::Commit)
//!     .filter(Filter::eq("project", "ABC"))
//!     .order(Order::desc("time"))
//!     .limit(1);
//! assert_eq!(query.kind(), Kind::Commit);
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::{Error, Result};

/// Record kinds held by the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// A registered project.
    Project,
    /// A commit notification.
    Commit,
    /// A successful build.
    Compilation,
    /// An architecture-has-built ping.
    Architecture,
    /// A community rating vote.
    Rating,
    /// A "won't build" report.
    Failure,
}

impl Kind {
    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Commit => "commit",
            Self::Compilation => "compilation",
            Self::Architecture => "architecture",
            Self::Rating => "rating",
            Self::Failure => "failure",
        }
    }

    /// All record kinds.
    #[must_use]
    pub const fn all() -> [Self; 6] {
        [
            Self::Project,
            Self::Commit,
            Self::Compilation,
            Self::Architecture,
            Self::Rating,
            Self::Failure,
        ]
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a record: its kind plus a kind-unique name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    kind: Kind,
    name: String,
}

impl RecordKey {
    /// Creates a record key.
    #[must_use]
    pub fn new(kind: Kind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Returns the record kind.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        self.kind
    }

    /// Returns the kind-unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A field predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals value.
    Eq(String, Value),
    /// Field strictly greater than value.
    Gt(String, Value),
    /// Field greater than or equal to value.
    Ge(String, Value),
    /// Field strictly less than value.
    Lt(String, Value),
}

impl Filter {
    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    /// `field >= value`.
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge(field.into(), value.into())
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    /// Evaluates the predicate against a record.
    ///
    /// Records missing the field, or holding an incomparable value, never match.
    #[must_use]
    pub fn matches(&self, record: &Value) -> bool {
        let (field, expected) = match self {
            Self::Eq(f, v) | Self::Gt(f, v) | Self::Ge(f, v) | Self::Lt(f, v) => (f, v),
        };
        let Some(actual) = record.get(field) else {
            return false;
        };
        let Some(ordering) = compare_values(actual, expected) else {
            return false;
        };
        match self {
            Self::Eq(..) => ordering == Ordering::Equal,
            Self::Gt(..) => ordering == Ordering::Greater,
            Self::Ge(..) => ordering != Ordering::Less,
            Self::Lt(..) => ordering == Ordering::Less,
        }
    }
}

/// Sort direction on a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Order {
    /// Ascending by field.
    Asc(String),
    /// Descending by field.
    Desc(String),
}

impl Order {
    /// Ascending by `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self::Asc(field.into())
    }

    /// Descending by `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self::Desc(field.into())
    }
}

/// A filtered, ordered, limited query over one record kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: Kind,
    filters: Vec<Filter>,
    order: Option<Order>,
    limit: Option<usize>,
}

impl Query {
    /// Creates a query matching every record of `kind`.
    #[must_use]
    pub const fn new(kind: Kind) -> Self {
        Self {
            kind,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Adds a filter (all filters must match).
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the result ordering.
    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns the queried kind.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        self.kind
    }

    /// Returns the filters.
    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Returns the ordering, if any.
    #[must_use]
    pub const fn ordering(&self) -> Option<&Order> {
        self.order.as_ref()
    }

    /// Returns the limit, if any.
    #[must_use]
    pub const fn max_results(&self) -> Option<usize> {
        self.limit
    }

    /// Returns true if a record of the queried kind satisfies every filter.
    #[must_use]
    pub fn matches(&self, record: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }
}

/// A record returned from a query.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// The record's key.
    pub key: RecordKey,
    /// The record body.
    pub value: Value,
}

/// Lazy, single-pass stream of query results.
pub type RecordStream = BoxStream<'static, Result<StoredRecord>>;

/// Event store trait.
///
/// All operations take an explicit [`Context`]. Implementations must be safe
/// to share across tasks.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Reads a record.
    ///
    /// Returns `Error::NotFound` if the record doesn't exist.
    async fn get(&self, ctx: &Context, key: &RecordKey) -> Result<Value>;

    /// Writes a record, replacing any previous value under the key.
    async fn put(&self, ctx: &Context, key: &RecordKey, record: Value) -> Result<RecordKey>;

    /// Deletes a record.
    ///
    /// Succeeds even if the record doesn't exist (idempotent).
    async fn delete(&self, ctx: &Context, key: &RecordKey) -> Result<()>;

    /// Runs a query and returns a lazy stream of matching records.
    async fn query(&self, ctx: &Context, query: Query) -> Result<RecordStream>;

    /// Counts matching records without materialising them.
    async fn count(&self, ctx: &Context, query: &Query) -> Result<u64>;
}

/// Orders two JSON scalars of the same type.
///
/// Numbers compare numerically, strings lexically, booleans `false < true`.
/// Mixed or compound values are incomparable.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// In-memory event store.
///
/// Thread-safe via `RwLock`. Queries snapshot matching records at call time.
#[derive(Debug, Default, Clone)]
pub struct MemoryEventStore {
    records: Arc<RwLock<BTreeMap<RecordKey, Value>>>,
}

impl MemoryEventStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records of `kind` (test helper, no context).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len_of(&self, kind: Kind) -> Result<usize> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.keys().filter(|k| k.kind == kind).count())
    }

    fn matching(&self, query: &Query) -> Result<Vec<StoredRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut matched: Vec<StoredRecord> = records
            .iter()
            .filter(|(key, value)| key.kind == query.kind && query.matches(value))
            .map(|(key, value)| StoredRecord {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        drop(records);

        if let Some(order) = &query.order {
            let (field, descending) = match order {
                Order::Asc(f) => (f.as_str(), false),
                Order::Desc(f) => (f.as_str(), true),
            };
            matched.sort_by(|a, b| {
                let ordering = match (a.value.get(field), b.value.get(field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                let ordering = if descending {
                    ordering.reverse()
                } else {
                    ordering
                };
                ordering.then_with(|| a.key.cmp(&b.key))
            });
        }

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "event store lock poisoned".into(),
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn get(&self, _ctx: &Context, key: &RecordKey) -> Result<Value> {
        let records = self.records.read().map_err(|_| poisoned())?;
        records
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("record not found: {key}")))
    }

    async fn put(&self, _ctx: &Context, key: &RecordKey, record: Value) -> Result<RecordKey> {
        if !record.is_object() {
            return Err(Error::InvalidInput(format!(
                "record {key} must be a JSON object"
            )));
        }
        self.records
            .write()
            .map_err(|_| poisoned())?
            .insert(key.clone(), record);
        Ok(key.clone())
    }

    async fn delete(&self, _ctx: &Context, key: &RecordKey) -> Result<()> {
        self.records.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    async fn query(&self, _ctx: &Context, query: Query) -> Result<RecordStream> {
        let matched = self.matching(&query)?;
        Ok(futures::stream::iter(matched.into_iter().map(Ok)).boxed())
    }

    async fn count(&self, _ctx: &Context, query: &Query) -> Result<u64> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let count = records
            .iter()
            .filter(|(key, value)| key.kind == query.kind && query.matches(value))
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn ctx() -> Context {
        Context::new("test")
    }

    async fn seed(store: &MemoryEventStore) {
        for (name, project, time, counted) in [
            ("a1", "A", 10, false),
            ("a2", "A", 30, true),
            ("a3", "A", 20, false),
            ("b1", "B", 40, false),
        ] {
            store
                .put(
                    &ctx(),
                    &RecordKey::new(Kind::Commit, name),
                    json!({ "project": project, "time": time, "counted": counted }),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryEventStore::new();
        let err = store
            .get(&ctx(), &RecordKey::new(Kind::Project, "nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_is_last_write_wins() {
        let store = MemoryEventStore::new();
        let key = RecordKey::new(Kind::Rating, "r");
        store.put(&ctx(), &key, json!({ "v": 1 })).await.unwrap();
        store.put(&ctx(), &key, json!({ "v": 2 })).await.unwrap();
        assert_eq!(store.get(&ctx(), &key).await.unwrap(), json!({ "v": 2 }));
        assert_eq!(store.len_of(Kind::Rating).unwrap(), 1);
    }

    #[tokio::test]
    async fn put_rejects_non_objects() {
        let store = MemoryEventStore::new();
        let result = store
            .put(&ctx(), &RecordKey::new(Kind::Rating, "r"), json!(3))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryEventStore::new();
        let key = RecordKey::new(Kind::Commit, "c");
        store.put(&ctx(), &key, json!({})).await.unwrap();
        store.delete(&ctx(), &key).await.unwrap();
        store.delete(&ctx(), &key).await.unwrap();
        assert_eq!(store.len_of(Kind::Commit).unwrap(), 0);
    }

    #[tokio::test]
    async fn query_filters_orders_and_limits() {
        let store = MemoryEventStore::new();
        seed(&store).await;

        let query = Query::new(Kind::Commit)
            .filter(Filter::eq("project", "A"))
            .order(Order::desc("time"));
        let rows: Vec<StoredRecord> = store
            .query(&ctx(), query.clone())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.key.name()).collect();
        assert_eq!(names, ["a2", "a3", "a1"]);

        let rows: Vec<StoredRecord> = store
            .query(&ctx(), query.limit(1))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.name(), "a2");
    }

    #[tokio::test]
    async fn count_matches_query() {
        let store = MemoryEventStore::new();
        seed(&store).await;

        let uncounted = Query::new(Kind::Commit)
            .filter(Filter::eq("project", "A"))
            .filter(Filter::eq("counted", false));
        assert_eq!(store.count(&ctx(), &uncounted).await.unwrap(), 2);

        let recent = Query::new(Kind::Commit).filter(Filter::gt("time", 20));
        assert_eq!(store.count(&ctx(), &recent).await.unwrap(), 2);

        let other_kind = Query::new(Kind::Compilation);
        assert_eq!(store.count(&ctx(), &other_kind).await.unwrap(), 0);
    }

    #[test]
    fn filters_on_missing_or_mismatched_fields_never_match() {
        let record = json!({ "time": 5 });
        assert!(!Filter::eq("project", "A").matches(&record));
        assert!(!Filter::gt("time", "5").matches(&record));
        assert!(Filter::ge("time", 5).matches(&record));
        assert!(Filter::lt("time", 6).matches(&record));
    }
}
