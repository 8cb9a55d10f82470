//! Event ingestion from external webhooks.
//!
//! [`Ingestor::ingest`] validates the project id, persists one de-duplicated
//! event, invalidates the project's cached stats and schedules a refresh.
//! Only the event write is load-bearing: once it succeeds the request
//! succeeds, even if invalidation or scheduling fails, so a retrying sender
//! never records the same event twice. Reconciliation picks the event up
//! regardless.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::Instrument;
use vitals_core::id::parse_hash;
use vitals_core::{
    Clock, Context, EnqueueResult, EventStore, Kind, ProjectId, RecordKey, TaskQueue,
};

use crate::config::StatsConfig;
use crate::error::IngestError;
use crate::events::{self, Countable};
use crate::metrics;
use crate::populate::StatsPopulator;
use crate::project;

/// What a webhook reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventCategory {
    /// A commit landed.
    Commit,
    /// A build succeeded, optionally on a named architecture (hash).
    Build {
        /// Architecture hash, when the builder reports one.
        architecture: Option<String>,
    },
    /// A community rating vote.
    Rating,
    /// A "won't build" report.
    Failure,
}

impl EventCategory {
    /// Event kind recorded for this category.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Commit => Kind::Commit,
            Self::Build { .. } => Kind::Compilation,
            Self::Rating => Kind::Rating,
            Self::Failure => Kind::Failure,
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

/// Successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Key of the recorded event.
    pub key: RecordKey,
    /// Key of the architecture ping, for builds that named one.
    pub architecture: Option<RecordKey>,
    /// Whether a refresh task is pending for the project.
    pub refresh_scheduled: bool,
}

/// Webhook entry point.
pub struct Ingestor {
    store: Arc<dyn EventStore>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    populator: Arc<StatsPopulator>,
    config: StatsConfig,
}

impl fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingestor")
            .field("queue", &self.queue.queue_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Ingestor {
    /// Creates an ingestor.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        populator: Arc<StatsPopulator>,
        config: StatsConfig,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            populator,
            config,
        }
    }

    /// Records one event for `project_id`.
    ///
    /// `submitter` is the requester's network address; it keys rating and
    /// failure votes so repeat submissions overwrite.
    ///
    /// # Errors
    ///
    /// - [`IngestError::BadRequest`] for a malformed project or architecture id
    /// - [`IngestError::UnknownProject`] if the project is not registered
    /// - [`IngestError::Internal`] if reading the project or writing the event
    ///   fails; the sender should retry
    pub async fn ingest(
        &self,
        ctx: &Context,
        project_id: &str,
        category: EventCategory,
        submitter: &str,
    ) -> Result<IngestReceipt, IngestError> {
        let span = ctx.span("ingest");
        async {
            let receipt = self.record(ctx, project_id, &category, submitter).await;
            match &receipt {
                Ok(receipt) => {
                    metrics::record_ingested(category.kind().as_str());
                    tracing::info!(
                        key = %receipt.key,
                        refresh_scheduled = receipt.refresh_scheduled,
                        "event ingested"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        project = project_id,
                        category = %category,
                        code = e.code(),
                        error = %e,
                        "event rejected"
                    );
                }
            }
            receipt
        }
        .instrument(span)
        .await
    }

    async fn record(
        &self,
        ctx: &Context,
        project_id: &str,
        category: &EventCategory,
        submitter: &str,
    ) -> Result<IngestReceipt, IngestError> {
        let id = ProjectId::parse(project_id).map_err(|e| IngestError::BadRequest {
            reason: e.to_string(),
        })?;
        let architecture = match category {
            EventCategory::Build {
                architecture: Some(arch),
            } => Some(parse_hash("architecture", arch).map_err(|e| {
                IngestError::BadRequest {
                    reason: e.to_string(),
                }
            })?),
            _ => None,
        };

        project::load(ctx, self.store.as_ref(), &id).await?;

        let now = self.clock.now();
        let event = match category {
            EventCategory::Commit | EventCategory::Build { .. } => {
                Countable::ticked(category.kind(), &id, now)
            }
            EventCategory::Rating | EventCategory::Failure => {
                Countable::vote(category.kind(), &id, submitter, now)
            }
        };
        events::save(ctx, self.store.as_ref(), &event).await?;

        let architecture = match architecture {
            Some(arch) => {
                let ping = Countable::architecture(&id, &arch, now);
                events::save(ctx, self.store.as_ref(), &ping).await?;
                Some(ping.key)
            }
            None => None,
        };

        if let Err(e) = self.populator.invalidate(ctx, &id).await {
            tracing::warn!(project = %id, error = %e, "stats cache invalidation failed");
        }
        let refresh_scheduled = self.schedule_refresh(ctx, &id).await;

        Ok(IngestReceipt {
            key: event.key,
            architecture,
            refresh_scheduled,
        })
    }

    async fn schedule_refresh(&self, ctx: &Context, id: &ProjectId) -> bool {
        let path = self.config.refresh_path(id.as_str());
        let payload = Bytes::from(id.as_str().to_owned());
        match self.queue.enqueue(ctx, &path, payload).await {
            Ok(result @ (EnqueueResult::Enqueued { .. } | EnqueueResult::Deduplicated { .. })) => {
                tracing::debug!(
                    project = %id,
                    message_id = result.message_id().unwrap_or_default(),
                    "refresh scheduled"
                );
                true
            }
            Ok(EnqueueResult::QueueFull) => {
                tracing::warn!(
                    project = %id,
                    queue = self.queue.queue_name(),
                    "refresh queue full"
                );
                false
            }
            Err(e) => {
                tracing::warn!(project = %id, error = %e, "refresh enqueue failed");
                false
            }
        }
    }
}
