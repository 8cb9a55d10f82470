//! Deferred task queue abstraction.
//!
//! Work is enqueued by target path plus an opaque payload. Delivery is
//! at-least-once from the caller's point of view, so handlers must be
//! idempotent.
//!
//! - [`TaskQueue`]: Trait for enqueueing deferred work
//! - [`InMemoryTaskQueue`]: In-memory queue for testing
//!
//! ## Limitations of the in-memory queue
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Deduplication is queue-scoped**: Identical pending tasks collapse;
//!   keys are released when tasks are taken

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::context::Context;
use crate::error::{Error, Result};

/// Result of enqueuing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Task was enqueued successfully.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// An identical task is already pending.
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
    /// Queue is at capacity.
    QueueFull,
}

impl EnqueueResult {
    /// Returns true if the task will run (newly enqueued or already pending).
    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        matches!(self, Self::Enqueued { .. } | Self::Deduplicated { .. })
    }

    /// Returns the message ID if the task is scheduled.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => Some(message_id),
            Self::QueueFull => None,
        }
    }
}

/// Task queue trait.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Enqueues `payload` for delivery to `target_path`.
    async fn enqueue(
        &self,
        ctx: &Context,
        target_path: &str,
        payload: Bytes,
    ) -> Result<EnqueueResult>;

    /// Returns the queue's name.
    fn queue_name(&self) -> &str;
}

/// A task waiting in the in-memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    /// Message ID.
    pub message_id: String,
    /// Handler path the task targets.
    pub target_path: String,
    /// Opaque payload.
    pub payload: Bytes,
    /// Request id of the context that enqueued it.
    pub request_id: String,
    /// When the task was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedTask {
    fn dedup_key(target_path: &str, payload: &[u8]) -> String {
        format!("{target_path}#{}", hex::encode(payload))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<QueuedTask>,
    pending: HashMap<String, String>,
}

/// In-memory task queue.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    name: String,
    state: RwLock<QueueState>,
    max_capacity: Option<usize>,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("task queue lock poisoned")
}

impl InMemoryTaskQueue {
    /// Creates a new in-memory task queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
            max_capacity: None,
        }
    }

    /// Creates a queue with a maximum capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, max_capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
            max_capacity: Some(max_capacity),
        }
    }

    /// Takes the next task from the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<QueuedTask>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let task = state.queue.pop_front();
        if let Some(ref task) = task {
            state
                .pending
                .remove(&QueuedTask::dedup_key(&task.target_path, &task.payload));
        }
        drop(state);
        Ok(task)
    }

    /// Removes and returns every pending task.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<QueuedTask>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let drained: Vec<_> = state.queue.drain(..).collect();
        state.pending.clear();
        drop(state);
        Ok(drained)
    }

    /// Returns the number of pending tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn depth(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.queue.len())
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        ctx: &Context,
        target_path: &str,
        payload: Bytes,
    ) -> Result<EnqueueResult> {
        let key = QueuedTask::dedup_key(target_path, &payload);
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.pending.get(&key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_message_id: existing.clone(),
            });
        }

        if let Some(max) = self.max_capacity {
            if state.queue.len() >= max {
                return Ok(EnqueueResult::QueueFull);
            }
        }

        let message_id = Ulid::new().to_string();
        state.pending.insert(key, message_id.clone());
        state.queue.push_back(QueuedTask {
            message_id: message_id.clone(),
            target_path: target_path.to_string(),
            payload,
            request_id: ctx.request_id().to_string(),
            enqueued_at: Utc::now(),
        });
        drop(state);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_take() -> Result<()> {
        let queue = InMemoryTaskQueue::new("test");
        let ctx = Context::new("test");

        let result = queue.enqueue(&ctx, "/task/refresh/A", Bytes::new()).await?;
        assert!(matches!(result, EnqueueResult::Enqueued { .. }));

        let task = queue.take()?.expect("should have task");
        assert_eq!(task.target_path, "/task/refresh/A");
        assert_eq!(task.request_id, ctx.request_id());
        assert!(queue.take()?.is_none());

        // Dedup key is released after take
        let result = queue.enqueue(&ctx, "/task/refresh/A", Bytes::new()).await?;
        assert!(matches!(result, EnqueueResult::Enqueued { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn pending_duplicates_collapse() -> Result<()> {
        let queue = InMemoryTaskQueue::new("test");
        let ctx = Context::new("test");

        let first = queue.enqueue(&ctx, "/task/refresh/A", Bytes::new()).await?;
        let second = queue.enqueue(&ctx, "/task/refresh/A", Bytes::new()).await?;
        assert!(second.is_scheduled());
        assert_eq!(first.message_id(), second.message_id());

        queue.enqueue(&ctx, "/task/refresh/B", Bytes::new()).await?;
        assert_eq!(queue.depth()?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn capacity_limit() -> Result<()> {
        let queue = InMemoryTaskQueue::with_capacity("test", 1);
        let ctx = Context::new("test");

        queue.enqueue(&ctx, "/a", Bytes::new()).await?;
        let full = queue.enqueue(&ctx, "/b", Bytes::new()).await?;
        assert_eq!(full, EnqueueResult::QueueFull);
        assert!(!full.is_scheduled());
        Ok(())
    }

    #[tokio::test]
    async fn drain_empties_queue() -> Result<()> {
        let queue = InMemoryTaskQueue::default();
        let ctx = Context::new("test");
        queue.enqueue(&ctx, "/a", Bytes::new()).await?;
        queue.enqueue(&ctx, "/b", Bytes::new()).await?;

        assert_eq!(queue.drain()?.len(), 2);
        assert_eq!(queue.depth()?, 0);
        assert_eq!(queue.queue_name(), "default");
        Ok(())
    }
}
