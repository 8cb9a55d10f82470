//! Deferred refresh task handler.
//!
//! Ingestion enqueues `{refresh_path_prefix}{project id}`; running the task
//! forces a recompute of the project's derived statistics and repopulates the
//! cache. Refresh is idempotent, so duplicate deliveries are harmless.

use std::sync::Arc;

use tracing::Instrument;
use vitals_core::{Context, EventStore, InMemoryTaskQueue, ProjectId};

use crate::error::{Result, StatsError};
use crate::populate::StatsPopulator;
use crate::project::{self, Project};

/// Tallies from draining a refresh queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Tasks that refreshed a project.
    pub refreshed: u64,
    /// Tasks that failed.
    pub failed: u64,
}

/// Runs refresh tasks.
pub struct RefreshHandler {
    store: Arc<dyn EventStore>,
    populator: Arc<StatsPopulator>,
}

impl std::fmt::Debug for RefreshHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshHandler")
            .field("populator", &self.populator)
            .finish_non_exhaustive()
    }
}

impl RefreshHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, populator: Arc<StatsPopulator>) -> Self {
        Self { store, populator }
    }

    /// Handles one refresh task addressed to `target_path`.
    ///
    /// Returns the freshly populated project.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the path does not name a project id,
    /// [`StatsError::UnknownProject`] if the project is gone, or the
    /// population error.
    pub async fn handle(&self, ctx: &Context, target_path: &str) -> Result<Project> {
        let span = ctx.span("refresh");
        async {
            let id = self.parse_path(target_path)?;
            let mut project = project::load(ctx, self.store.as_ref(), &id).await?;
            project.mark_dirty();
            self.populator.populate(ctx, &mut project).await?;
            tracing::debug!(project = %id, "project refreshed");
            Ok::<Project, StatsError>(project)
        }
        .instrument(span)
        .await
    }

    /// Runs every pending task in `queue`, oldest first.
    ///
    /// Failures are logged and counted; they do not stop the drain.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself cannot be read.
    pub async fn drain_queue(&self, queue: &InMemoryTaskQueue) -> Result<RefreshSummary> {
        let mut summary = RefreshSummary::default();
        while let Some(task) = queue.take().map_err(StatsError::from)? {
            let ctx = Context::new("refresh").with_request_id(task.message_id.clone());
            match self.handle(&ctx, &task.target_path).await {
                Ok(_) => summary.refreshed += 1,
                Err(e) => {
                    tracing::warn!(
                        path = %task.target_path,
                        message_id = %task.message_id,
                        error = %e,
                        "refresh task failed"
                    );
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    fn parse_path(&self, target_path: &str) -> Result<ProjectId> {
        let prefix = &self.populator.config().refresh_path_prefix;
        let raw = target_path.strip_prefix(prefix.as_str()).ok_or_else(|| {
            StatsError::validation(format!("'{target_path}' is not a refresh task path"))
        })?;
        Ok(ProjectId::parse(raw.trim_end_matches('/'))?)
    }
}
