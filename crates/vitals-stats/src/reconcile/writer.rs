//! Bounded concurrent writer for reconciliation work.
//!
//! Drains a delete queue and a write queue until both are closed and empty,
//! running at most `concurrency` store operations at a time. Failures are
//! counted and the first one (in completion order) is kept as the
//! representative error. Nothing is rolled back. Successful writes of counted
//! events are tallied per project so totals only grow by what was persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::{JoinError, JoinSet};
use vitals_core::{Context, EventStore, ProjectId, RecordKey};

use crate::error::{Result, StatsError};
use crate::events::{self, Countable};
use crate::project::{self, Project};

/// A record the reconciliation job persists or removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// A commit event.
    Commit(Countable),
    /// A compilation event.
    Compilation(Countable),
    /// An architecture ping.
    Architecture(Countable),
    /// A project with recomputed counters.
    Project(Box<Project>),
}

impl WorkItem {
    /// Store key of the item.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Commit(event) | Self::Compilation(event) | Self::Architecture(event) => {
                event.key.clone()
            }
            Self::Project(project) => project.key(),
        }
    }

    /// Writes the item's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the store write fails.
    pub async fn persist(&self, ctx: &Context, store: &dyn EventStore) -> Result<()> {
        match self {
            Self::Commit(event) | Self::Compilation(event) | Self::Architecture(event) => {
                events::save(ctx, store, event).await
            }
            Self::Project(project) => project::save(ctx, store, project).await,
        }
    }

    /// Deletes the item.
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn remove(&self, ctx: &Context, store: &dyn EventStore) -> Result<()> {
        store
            .delete(ctx, &self.key())
            .await
            .map_err(StatsError::Store)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Persist,
    Remove,
}

impl Op {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Persist => "persist",
            Self::Remove => "remove",
        }
    }
}

/// Events of one project written back with `counted` set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountedEvents {
    /// Commits.
    pub commits: u64,
    /// Compilations.
    pub compilations: u64,
}

impl CountedEvents {
    /// Both kinds together.
    #[must_use]
    pub const fn total(self) -> u64 {
        self.commits + self.compilations
    }
}

/// Tallies from one writer drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterOutcome {
    /// Records persisted.
    pub written: u64,
    /// Projects among the persisted records.
    pub projects_written: u64,
    /// Records deleted.
    pub deleted: u64,
    /// Failed operations.
    pub errors: u64,
    /// First failure observed.
    pub first_error: Option<String>,
    /// Counted events persisted, per project.
    pub counted: BTreeMap<ProjectId, CountedEvents>,
}

impl WriterOutcome {
    /// Folds the tallies of a later drain into this one.
    pub fn merge(&mut self, later: Self) {
        self.written += later.written;
        self.projects_written += later.projects_written;
        self.deleted += later.deleted;
        self.errors += later.errors;
        if self.first_error.is_none() {
            self.first_error = later.first_error;
        }
        for (project, counted) in later.counted {
            let entry = self.counted.entry(project).or_default();
            entry.commits += counted.commits;
            entry.compilations += counted.compilations;
        }
    }

    /// Counted events persisted for `project`.
    #[must_use]
    pub fn counted_for(&self, project: &ProjectId) -> CountedEvents {
        self.counted.get(project).copied().unwrap_or_default()
    }

    fn record_failure(&mut self, what: String) {
        self.errors += 1;
        if self.first_error.is_none() {
            self.first_error = Some(what);
        }
    }

    fn record(&mut self, joined: std::result::Result<(Op, WorkItem, Result<()>), JoinError>) {
        match joined {
            Ok((op, item, Ok(()))) => match op {
                Op::Remove => self.deleted += 1,
                Op::Persist => {
                    self.written += 1;
                    match &item {
                        WorkItem::Project(_) => self.projects_written += 1,
                        WorkItem::Commit(event) if event.counted => {
                            self.counted.entry(event.project.clone()).or_default().commits += 1;
                        }
                        WorkItem::Compilation(event) if event.counted => {
                            self.counted
                                .entry(event.project.clone())
                                .or_default()
                                .compilations += 1;
                        }
                        _ => {}
                    }
                }
            },
            Ok((op, item, Err(e))) => {
                tracing::warn!(
                    op = op.as_str(),
                    item = %item,
                    error = %e,
                    metric = "vitals_reconcile_errors_total",
                    "reconcile work item failed"
                );
                self.record_failure(format!("{} {item}: {e}", op.as_str()));
            }
            Err(e) => {
                tracing::error!(error = %e, "reconcile worker task failed");
                self.record_failure(format!("worker task failed: {e}"));
            }
        }
    }
}

/// Applies every queued item until both queues are closed and drained.
pub async fn drain(
    ctx: Context,
    store: Arc<dyn EventStore>,
    mut deletes: UnboundedReceiver<WorkItem>,
    mut writes: UnboundedReceiver<WorkItem>,
    concurrency: usize,
) -> WriterOutcome {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut in_flight = JoinSet::new();
    let mut outcome = WriterOutcome::default();
    let mut deletes_open = true;
    let mut writes_open = true;

    loop {
        let (op, item) = tokio::select! {
            item = deletes.recv(), if deletes_open => match item {
                Some(item) => (Op::Remove, item),
                None => {
                    deletes_open = false;
                    continue;
                }
            },
            item = writes.recv(), if writes_open => match item {
                Some(item) => (Op::Persist, item),
                None => {
                    writes_open = false;
                    continue;
                }
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                outcome.record(joined);
                continue;
            }
            else => break,
        };

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            outcome.record_failure(format!("{} {item}: writer semaphore closed", op.as_str()));
            continue;
        };
        let ctx = ctx.clone();
        let store = Arc::clone(&store);
        in_flight.spawn(async move {
            let _permit = permit;
            let result = match op {
                Op::Persist => item.persist(&ctx, store.as_ref()).await,
                Op::Remove => item.remove(&ctx, store.as_ref()).await,
            };
            (op, item, result)
        });
    }

    outcome
}
