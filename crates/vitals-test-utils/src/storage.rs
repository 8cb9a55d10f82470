//! Event store with operation tracing.
//!
//! Wraps [`MemoryEventStore`], records every call for test assertions and
//! fails calls on demand.

use std::sync::{Arc, Mutex};

use vitals_core::error::{Error, Result};
use vitals_core::{Context, EventStore, Kind, MemoryEventStore, Query, RecordKey, RecordStream};

/// Kind of store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// `get`
    Get,
    /// `put`
    Put,
    /// `delete`
    Delete,
    /// `query`
    Query,
    /// `count`
    Count,
}

/// Record of a store operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Point read.
    Get {
        /// Key that was read.
        key: RecordKey,
    },
    /// Write.
    Put {
        /// Key that was written.
        key: RecordKey,
    },
    /// Delete.
    Delete {
        /// Key that was deleted.
        key: RecordKey,
    },
    /// Streamed query.
    Query {
        /// Kind that was queried.
        kind: Kind,
    },
    /// Count query.
    Count {
        /// Kind that was counted.
        kind: Kind,
    },
}

impl StoreOp {
    /// Returns the operation kind.
    #[must_use]
    pub const fn op(&self) -> OpKind {
        match self {
            Self::Get { .. } => OpKind::Get,
            Self::Put { .. } => OpKind::Put,
            Self::Delete { .. } => OpKind::Delete,
            Self::Query { .. } => OpKind::Query,
            Self::Count { .. } => OpKind::Count,
        }
    }

    /// Returns true for writes and deletes.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        matches!(self, Self::Put { .. } | Self::Delete { .. })
    }
}

#[derive(Debug, Clone)]
struct FailureRule {
    op: Option<OpKind>,
    prefix: String,
}

/// In-memory event store with operation tracing and failure injection.
///
/// Failure rules match on `"{kind}/{name}"` key prefixes; queries and counts
/// match as `"{kind}/"`.
#[derive(Debug, Clone, Default)]
pub struct TracingEventStore {
    inner: MemoryEventStore,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    failures: Arc<Mutex<Vec<FailureRule>>>,
}

impl TracingEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the untraced backing store.
    #[must_use]
    pub fn inner(&self) -> &MemoryEventStore {
        &self.inner
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Returns how many operations of `op` were recorded.
    #[must_use]
    pub fn count_of(&self, op: OpKind) -> usize {
        self.operations
            .lock()
            .expect("lock")
            .iter()
            .filter(|o| o.op() == op)
            .count()
    }

    /// Returns the recorded writes and deletes.
    #[must_use]
    pub fn mutations(&self) -> Vec<StoreOp> {
        self.operations()
            .into_iter()
            .filter(StoreOp::is_mutation)
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails every operation whose key starts with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.failures.lock().expect("lock").push(FailureRule {
            op: None,
            prefix: prefix.into(),
        });
    }

    /// Fails operations of kind `op` whose key starts with `prefix`.
    pub fn inject_op_failure(&self, op: OpKind, prefix: impl Into<String>) {
        self.failures.lock().expect("lock").push(FailureRule {
            op: Some(op),
            prefix: prefix.into(),
        });
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.failures.lock().expect("lock").clear();
    }

    /// Returns the number of records of `kind`.
    #[must_use]
    pub fn len_of(&self, kind: Kind) -> usize {
        self.inner.len_of(kind).expect("lock")
    }

    fn record(&self, op: StoreOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, op: OpKind, target: &str) -> Result<()> {
        let failures = self.failures.lock().expect("lock");
        let hit = failures
            .iter()
            .any(|rule| rule.op.is_none_or(|o| o == op) && target.starts_with(&rule.prefix));
        if hit {
            return Err(Error::storage(format!(
                "injected {op:?} failure for {target}"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventStore for TracingEventStore {
    async fn get(&self, ctx: &Context, key: &RecordKey) -> Result<serde_json::Value> {
        self.record(StoreOp::Get { key: key.clone() });
        self.check_failure(OpKind::Get, &key.to_string())?;
        self.inner.get(ctx, key).await
    }

    async fn put(
        &self,
        ctx: &Context,
        key: &RecordKey,
        record: serde_json::Value,
    ) -> Result<RecordKey> {
        self.record(StoreOp::Put { key: key.clone() });
        self.check_failure(OpKind::Put, &key.to_string())?;
        self.inner.put(ctx, key, record).await
    }

    async fn delete(&self, ctx: &Context, key: &RecordKey) -> Result<()> {
        self.record(StoreOp::Delete { key: key.clone() });
        self.check_failure(OpKind::Delete, &key.to_string())?;
        self.inner.delete(ctx, key).await
    }

    async fn query(&self, ctx: &Context, query: Query) -> Result<RecordStream> {
        self.record(StoreOp::Query { kind: query.kind() });
        self.check_failure(OpKind::Query, &format!("{}/", query.kind()))?;
        self.inner.query(ctx, query).await
    }

    async fn count(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.record(StoreOp::Count { kind: query.kind() });
        self.check_failure(OpKind::Count, &format!("{}/", query.kind()))?;
        self.inner.count(ctx, query).await
    }
}
