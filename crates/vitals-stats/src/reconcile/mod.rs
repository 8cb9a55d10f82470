//! Whole-corpus reconciliation.
//!
//! A run brings every project's persisted counters into agreement with the
//! event corpus and prunes events that no longer apply:
//!
//! 1. **Load**: projects, commits, compilations and architecture pings are
//!    loaded by four concurrent tasks. Commits and compilations at or before
//!    the weekly cutoff are split off for deletion. Any load error aborts the
//!    run before anything is written.
//! 2. **Join**: a single pass over the loaded events recounts weekly and
//!    at-HEAD counters, folds uncounted events into the all-time totals
//!    (flipping `counted`), and queues orphaned or superseded events for
//!    deletion.
//! 3. **Write**: a bounded writer pool drains the delete and event write
//!    queues. Item failures are counted; the run carries on.
//! 4. **Settle**: each project's all-time totals grow only by the counted
//!    events the writer actually persisted. Projects whose counters changed
//!    are then written by a second drain.
//!
//! Reconciliation is the only writer of `counted` and of the all-time
//! totals. An event whose write failed stays uncounted and out of the totals,
//! so running the job again converges.

mod writer;

pub use writer::{CountedEvents, WorkItem, WriterOutcome};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;
use ulid::Ulid;
use vitals_core::observability::job_span;
use vitals_core::{Clock, Context, EventStore, Kind, ProjectId, Timestamp};

use crate::config::StatsConfig;
use crate::error::{Result, StatsError};
use crate::events::{self, Countable};
use crate::metrics;
use crate::project::{self, Project, ProjectCounters};

const LOAD_TASKS: usize = 4;

/// Outcome of a reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Identifier of the run (also on the job span).
    pub run_id: String,
    /// Projects loaded.
    pub projects: u64,
    /// Projects whose counters were written.
    pub updated: u64,
    /// Events written back with `counted` set.
    pub events_counted: u64,
    /// Records deleted (stale, orphaned or superseded).
    pub deleted: u64,
    /// Work items that failed.
    pub errors: u64,
    /// First failure observed, if any.
    pub first_error: Option<String>,
}

impl ReconcileSummary {
    /// Returns true if any work item failed.
    #[must_use]
    pub const fn has_errors(&self) -> bool {
        self.errors > 0
    }

    /// Overall status of the run.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Batch`] carrying the first failure when any work
    /// item failed.
    pub fn status(&self) -> Result<()> {
        if !self.has_errors() {
            return Ok(());
        }
        Err(StatsError::Batch {
            first_error: self
                .first_error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
            errors: self.errors,
        })
    }
}

/// Work a run would perform, without performing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Records that would be deleted.
    pub deletes: Vec<WorkItem>,
    /// Records that would be written.
    pub writes: Vec<WorkItem>,
}

impl ReconcilePlan {
    /// Projects whose counters would change.
    #[must_use]
    pub fn projects(&self) -> Vec<&Project> {
        self.writes
            .iter()
            .filter_map(|item| match item {
                WorkItem::Project(project) => Some(project.as_ref()),
                _ => None,
            })
            .collect()
    }

    /// Returns true if the run would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.writes.is_empty()
    }
}

#[derive(Debug, Default)]
struct Corpus {
    projects: Vec<Project>,
    commits: Vec<Countable>,
    compilations: Vec<Countable>,
    architectures: Vec<Countable>,
    stale: Vec<WorkItem>,
}

enum Loaded {
    Projects(Result<Vec<Project>>),
    Commits(Result<Vec<Countable>>),
    Compilations(Result<Vec<Countable>>),
    Architectures(Result<Vec<Countable>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Delete,
    Write,
}

#[derive(Debug, Default)]
struct JoinStats {
    stale: u64,
    orphaned: u64,
    superseded: u64,
    counted: u64,
    changed: u64,
}

struct Working {
    project: Project,
    before: ProjectCounters,
    counters: ProjectCounters,
    folded: CountedEvents,
}

/// Recounted project awaiting the outcome of its event writes.
#[derive(Debug)]
struct ProjectUpdate {
    project: Project,
    before: ProjectCounters,
    folded: CountedEvents,
}

impl ProjectUpdate {
    /// Applies the persisted share of the folded events to the totals.
    ///
    /// Returns the project to write, or `None` if its counters end up
    /// unchanged.
    fn settle(self, persisted: CountedEvents) -> Option<Project> {
        let Self {
            mut project,
            before,
            folded,
        } = self;
        if persisted != folded {
            tracing::warn!(
                project = %project.id,
                folded = folded.total(),
                persisted = persisted.total(),
                "counted event writes failed; totals hold back the difference"
            );
        }
        project.counters.checkin_total = before.checkin_total + persisted.commits;
        project.counters.compile_total = before.compile_total + persisted.compilations;
        (project.counters != before).then_some(project)
    }

    /// Settles as if every folded event was persisted.
    fn planned(self) -> Option<Project> {
        let folded = self.folded;
        self.settle(folded)
    }
}

/// Periodic reconciliation of project counters against the event corpus.
pub struct ReconcileJob {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: StatsConfig,
}

impl std::fmt::Debug for ReconcileJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileJob")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReconcileJob {
    /// Creates a job.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>, config: StatsConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Runs reconciliation over the whole corpus.
    ///
    /// Item failures do not fail the run; they are reported in the summary
    /// (see [`ReconcileSummary::status`]).
    ///
    /// # Errors
    ///
    /// Returns an error if any load fails (nothing is written in that case)
    /// or the writer task dies.
    pub async fn run(&self, ctx: &Context) -> Result<ReconcileSummary> {
        let run_id = Ulid::new().to_string();
        let span = job_span("reconcile", &run_id);
        self.run_inner(ctx, run_id).instrument(span).await
    }

    /// Runs the load, join and diff phases and returns the planned work.
    ///
    /// # Errors
    ///
    /// Returns an error if any load fails.
    pub async fn plan(&self, ctx: &Context) -> Result<ReconcilePlan> {
        let cutoff = self.cutoff();
        let corpus = self.load(ctx, cutoff).await?;
        let mut plan = ReconcilePlan::default();
        let (_, updates) = join_and_recount(corpus, |queue, item| match queue {
            Queue::Delete => plan.deletes.push(item),
            Queue::Write => plan.writes.push(item),
        });
        plan.writes.extend(
            updates
                .into_iter()
                .filter_map(ProjectUpdate::planned)
                .map(|project| WorkItem::Project(Box::new(project))),
        );
        Ok(plan)
    }

    fn cutoff(&self) -> Timestamp {
        self.clock.now().minus_secs(self.config.weekly_window_secs)
    }

    async fn run_inner(&self, ctx: &Context, run_id: String) -> Result<ReconcileSummary> {
        let start = Instant::now();
        let cutoff = self.cutoff();
        tracing::info!(
            cutoff = cutoff.as_micros(),
            writer_concurrency = self.config.writer_concurrency,
            metric = "vitals_reconcile_run_started",
            "starting reconciliation"
        );

        let corpus = self.load(ctx, cutoff).await.inspect_err(|e| {
            tracing::error!(error = %e, phase = "load", "reconciliation aborted");
        })?;
        let projects = corpus.projects.len() as u64;
        tracing::info!(
            phase = "load",
            projects,
            commits = corpus.commits.len(),
            compilations = corpus.compilations.len(),
            architectures = corpus.architectures.len(),
            duration_secs = start.elapsed().as_secs_f64(),
            metric = "vitals_reconcile_phase_completed",
            "reconcile phase completed"
        );

        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer::drain(
            ctx.clone(),
            Arc::clone(&self.store),
            delete_rx,
            write_rx,
            self.config.writer_concurrency,
        ));

        let mut undelivered = 0_u64;
        let (joined, updates) = join_and_recount(corpus, |queue, item| {
            let tx = match queue {
                Queue::Delete => &delete_tx,
                Queue::Write => &write_tx,
            };
            if tx.send(item).is_err() {
                undelivered += 1;
            }
        });
        drop(delete_tx);
        drop(write_tx);
        tracing::info!(
            phase = "join",
            stale = joined.stale,
            orphaned = joined.orphaned,
            superseded = joined.superseded,
            counted = joined.counted,
            changed = joined.changed,
            metric = "vitals_reconcile_phase_completed",
            "reconcile phase completed"
        );

        let mut outcome = writer
            .await
            .map_err(|e| StatsError::internal(format!("reconcile writer failed: {e}")))?;

        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        drop(delete_tx);
        for update in updates {
            let persisted = outcome.counted_for(&update.project.id);
            let Some(project) = update.settle(persisted) else {
                continue;
            };
            if write_tx.send(WorkItem::Project(Box::new(project))).is_err() {
                undelivered += 1;
            }
        }
        drop(write_tx);
        outcome.merge(
            writer::drain(
                ctx.clone(),
                Arc::clone(&self.store),
                delete_rx,
                write_rx,
                self.config.writer_concurrency,
            )
            .await,
        );
        tracing::info!(
            phase = "settle",
            updated = outcome.projects_written,
            metric = "vitals_reconcile_phase_completed",
            "reconcile phase completed"
        );

        let mut summary = ReconcileSummary {
            run_id,
            projects,
            updated: outcome.projects_written,
            events_counted: outcome.written - outcome.projects_written,
            deleted: outcome.deleted,
            errors: outcome.errors,
            first_error: outcome.first_error,
        };
        if undelivered > 0 {
            summary.errors += undelivered;
            summary
                .first_error
                .get_or_insert_with(|| format!("{undelivered} item(s) never reached the writer"));
        }

        let duration_secs = start.elapsed().as_secs_f64();
        metrics::record_reconcile_completion(
            outcome.written,
            summary.deleted,
            summary.errors,
            duration_secs,
        );
        tracing::info!(
            projects = summary.projects,
            updated = summary.updated,
            events_counted = summary.events_counted,
            deleted = summary.deleted,
            errors = summary.errors,
            first_error = summary.first_error.as_deref().unwrap_or(""),
            duration_secs,
            metric = "vitals_reconcile_run_completed",
            "reconciliation completed"
        );
        Ok(summary)
    }

    async fn load(&self, ctx: &Context, cutoff: Timestamp) -> Result<Corpus> {
        let (tx, mut rx) = mpsc::channel(LOAD_TASKS);
        // Dropping the set on an early return aborts the remaining loads.
        let mut tasks = JoinSet::new();

        for kind in [
            Kind::Project,
            Kind::Commit,
            Kind::Compilation,
            Kind::Architecture,
        ] {
            let store = Arc::clone(&self.store);
            let ctx = ctx.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let loaded = match kind {
                    Kind::Project => Loaded::Projects(project::load_all(&ctx, store.as_ref()).await),
                    Kind::Commit => {
                        Loaded::Commits(events::load_all(&ctx, store.as_ref(), kind).await)
                    }
                    Kind::Compilation => {
                        Loaded::Compilations(events::load_all(&ctx, store.as_ref(), kind).await)
                    }
                    _ => Loaded::Architectures(events::load_all(&ctx, store.as_ref(), kind).await),
                };
                // A closed receiver means the run already aborted.
                let _ = tx.send(loaded).await;
            });
        }
        drop(tx);

        let mut corpus = Corpus::default();
        for _ in 0..LOAD_TASKS {
            let Some(loaded) = rx.recv().await else {
                return Err(StatsError::internal(
                    "reconcile load task exited without a result",
                ));
            };
            match loaded {
                Loaded::Projects(projects) => corpus.projects = projects?,
                Loaded::Commits(commits) => {
                    let (keep, stale) = split_stale(commits?, cutoff);
                    corpus.commits = keep;
                    corpus.stale.extend(stale.into_iter().map(WorkItem::Commit));
                }
                Loaded::Compilations(compilations) => {
                    let (keep, stale) = split_stale(compilations?, cutoff);
                    corpus.compilations = keep;
                    corpus
                        .stale
                        .extend(stale.into_iter().map(WorkItem::Compilation));
                }
                Loaded::Architectures(pings) => corpus.architectures = pings?,
            }
        }
        Ok(corpus)
    }
}

/// Splits events into those inside the window and those at or before `cutoff`.
fn split_stale(events: Vec<Countable>, cutoff: Timestamp) -> (Vec<Countable>, Vec<Countable>) {
    events.into_iter().partition(|event| event.time > cutoff)
}

fn join_and_recount(
    corpus: Corpus,
    mut emit: impl FnMut(Queue, WorkItem),
) -> (JoinStats, Vec<ProjectUpdate>) {
    let Corpus {
        projects,
        commits,
        compilations,
        architectures,
        stale,
    } = corpus;
    let mut stats = JoinStats {
        stale: stale.len() as u64,
        ..JoinStats::default()
    };
    for item in stale {
        emit(Queue::Delete, item);
    }

    let mut working: BTreeMap<ProjectId, Working> = projects
        .into_iter()
        .map(|project| {
            let before = project.counters;
            let counters = ProjectCounters {
                compile_week: 0,
                compile_at_head: 0,
                checkin_week: 0,
                ..before
            };
            (
                project.id.clone(),
                Working {
                    project,
                    before,
                    counters,
                    folded: CountedEvents::default(),
                },
            )
        })
        .collect();

    // Commits first: at-HEAD depends on each project's final last_checkin.
    for mut commit in commits {
        let Some(w) = working.get_mut(&commit.project) else {
            stats.orphaned += 1;
            emit(Queue::Delete, WorkItem::Commit(commit));
            continue;
        };
        w.counters.checkin_week += 1;
        w.counters.last_checkin = w.counters.last_checkin.max(commit.time);
        if !commit.counted {
            w.counters.checkin_total += 1;
            w.folded.commits += 1;
            commit.counted = true;
            stats.counted += 1;
            emit(Queue::Write, WorkItem::Commit(commit));
        }
    }

    for mut build in compilations {
        let Some(w) = working.get_mut(&build.project) else {
            stats.orphaned += 1;
            emit(Queue::Delete, WorkItem::Compilation(build));
            continue;
        };
        w.counters.compile_week += 1;
        w.counters.last_compile = w.counters.last_compile.max(build.time);
        let last_checkin = w.counters.last_checkin;
        if !last_checkin.is_zero() && build.time > last_checkin {
            w.counters.compile_at_head += 1;
        }
        if !build.counted {
            w.counters.compile_total += 1;
            w.folded.compilations += 1;
            build.counted = true;
            stats.counted += 1;
            emit(Queue::Write, WorkItem::Compilation(build));
        }
    }

    for ping in architectures {
        match working.get(&ping.project) {
            None => {
                stats.orphaned += 1;
                emit(Queue::Delete, WorkItem::Architecture(ping));
            }
            Some(w) if ping.time < w.counters.last_checkin => {
                stats.superseded += 1;
                emit(Queue::Delete, WorkItem::Architecture(ping));
            }
            Some(_) => {}
        }
    }

    let mut updates = Vec::new();
    for w in working.into_values() {
        if w.counters == w.before {
            continue;
        }
        let mut project = w.project;
        project.counters = w.counters;
        stats.changed += 1;
        updates.push(ProjectUpdate {
            project,
            before: w.before,
            folded: w.folded,
        });
    }

    (stats, updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(name: &str) -> Project {
        Project::register("o", name, Timestamp::ZERO).unwrap()
    }

    fn event(kind: Kind, project: &Project, at: i64, counted: bool) -> Countable {
        let mut event = Countable::ticked(kind, &project.id, Timestamp::from_micros(at));
        event.counted = counted;
        event
    }

    fn collect(corpus: Corpus) -> (Vec<WorkItem>, Vec<WorkItem>, JoinStats) {
        let mut deletes = Vec::new();
        let mut writes = Vec::new();
        let (stats, updates) = join_and_recount(corpus, |queue, item| match queue {
            Queue::Delete => deletes.push(item),
            Queue::Write => writes.push(item),
        });
        writes.extend(
            updates
                .into_iter()
                .filter_map(ProjectUpdate::planned)
                .map(|project| WorkItem::Project(Box::new(project))),
        );
        (deletes, writes, stats)
    }

    fn written_project(writes: &[WorkItem]) -> Option<&Project> {
        writes.iter().find_map(|item| match item {
            WorkItem::Project(project) => Some(project.as_ref()),
            _ => None,
        })
    }

    #[test]
    fn uncounted_events_fold_into_totals_once() {
        let p = project("widget");
        let corpus = Corpus {
            commits: vec![
                event(Kind::Commit, &p, 100, false),
                event(Kind::Commit, &p, 110, false),
                event(Kind::Commit, &p, 90, true),
            ],
            projects: vec![p],
            ..Corpus::default()
        };
        let (deletes, writes, stats) = collect(corpus);
        assert!(deletes.is_empty());
        assert_eq!(stats.counted, 2);

        let counted: Vec<_> = writes
            .iter()
            .filter_map(|item| match item {
                WorkItem::Commit(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(counted.len(), 2);
        assert!(counted.iter().all(|c| c.counted));

        let updated = written_project(&writes).unwrap();
        assert_eq!(updated.counters.checkin_total, 2);
        assert_eq!(updated.counters.checkin_week, 3);
        assert_eq!(updated.counters.last_checkin, Timestamp::from_micros(110));
    }

    #[test]
    fn builds_at_head_require_a_newer_build() {
        let p = project("widget");
        let corpus = Corpus {
            commits: vec![event(Kind::Commit, &p, 100, true)],
            compilations: vec![
                event(Kind::Compilation, &p, 100, true),
                event(Kind::Compilation, &p, 101, true),
            ],
            projects: vec![p],
            ..Corpus::default()
        };
        let (_, writes, _) = collect(corpus);
        let updated = written_project(&writes).unwrap();
        assert_eq!(updated.counters.compile_at_head, 1);
        assert_eq!(updated.counters.compile_week, 2);
        assert_eq!(updated.counters.compile_total, 0);
    }

    #[test]
    fn orphans_and_superseded_pings_are_deleted() {
        let p = project("widget");
        let ghost = project("ghost");
        let corpus = Corpus {
            commits: vec![
                event(Kind::Commit, &p, 100, true),
                event(Kind::Commit, &ghost, 100, false),
            ],
            compilations: vec![event(Kind::Compilation, &ghost, 120, false)],
            architectures: vec![
                Countable::architecture(&p.id, "A", Timestamp::from_micros(99)),
                Countable::architecture(&p.id, "B", Timestamp::from_micros(100)),
                Countable::architecture(&ghost.id, "C", Timestamp::from_micros(200)),
            ],
            projects: vec![p],
            ..Corpus::default()
        };
        let (deletes, _, stats) = collect(corpus);
        assert_eq!(stats.orphaned, 3);
        assert_eq!(stats.superseded, 1);
        assert_eq!(deletes.len(), 4);
        assert!(
            !deletes
                .iter()
                .any(|item| item.key().name().ends_with(":B"))
        );
    }

    #[test]
    fn unchanged_projects_are_not_written() {
        let mut p = project("widget");
        p.counters = ProjectCounters {
            checkin_total: 1,
            checkin_week: 1,
            last_checkin: Timestamp::from_micros(100),
            ..ProjectCounters::default()
        };
        let corpus = Corpus {
            commits: vec![event(Kind::Commit, &p, 100, true)],
            projects: vec![p],
            ..Corpus::default()
        };
        let (deletes, writes, stats) = collect(corpus);
        assert!(deletes.is_empty());
        assert!(writes.is_empty());
        assert_eq!(stats.changed, 0);
    }

    #[test]
    fn totals_grow_only_by_persisted_events() {
        let mut p = project("widget");
        p.counters.checkin_total = 5;
        let corpus = Corpus {
            commits: vec![
                event(Kind::Commit, &p, 100, false),
                event(Kind::Commit, &p, 110, false),
            ],
            compilations: vec![event(Kind::Compilation, &p, 120, false)],
            projects: vec![p],
            ..Corpus::default()
        };
        let (_, mut updates) = join_and_recount(corpus, |_, _| {});
        let update = updates.pop().unwrap();
        assert_eq!(
            update.folded,
            CountedEvents {
                commits: 2,
                compilations: 1
            }
        );

        let settled = update
            .settle(CountedEvents {
                commits: 1,
                compilations: 0,
            })
            .unwrap();
        assert_eq!(settled.counters.checkin_total, 6);
        assert_eq!(settled.counters.compile_total, 0);
        assert_eq!(settled.counters.checkin_week, 2);
        assert_eq!(settled.counters.last_compile, Timestamp::from_micros(120));
    }

    #[test]
    fn nothing_persisted_and_nothing_else_changed_skips_the_project() {
        let mut p = project("widget");
        p.counters = ProjectCounters {
            checkin_total: 3,
            checkin_week: 1,
            last_checkin: Timestamp::from_micros(100),
            ..ProjectCounters::default()
        };
        let corpus = Corpus {
            commits: vec![event(Kind::Commit, &p, 100, false)],
            projects: vec![p],
            ..Corpus::default()
        };
        let (stats, mut updates) = join_and_recount(corpus, |_, _| {});
        assert_eq!(stats.changed, 1);
        let update = updates.pop().unwrap();
        assert!(update.settle(CountedEvents::default()).is_none());
    }

    #[test]
    fn stale_split_is_strict_on_the_cutoff() {
        let p = project("widget");
        let cutoff = Timestamp::from_micros(1_000);
        let (keep, stale) = split_stale(
            vec![
                event(Kind::Commit, &p, 999, false),
                event(Kind::Commit, &p, 1_000, false),
                event(Kind::Commit, &p, 1_001, false),
            ],
            cutoff,
        );
        assert_eq!(keep.len(), 1);
        assert_eq!(keep[0].time, Timestamp::from_micros(1_001));
        assert_eq!(stale.len(), 2);
    }

    #[test]
    fn summary_status_reports_first_error() {
        let summary = ReconcileSummary {
            errors: 2,
            first_error: Some("persist commit/x: boom".into()),
            ..ReconcileSummary::default()
        };
        match summary.status() {
            Err(StatsError::Batch {
                first_error,
                errors,
            }) => {
                assert_eq!(errors, 2);
                assert_eq!(first_error, "persist commit/x: boom");
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(ReconcileSummary::default().status().is_ok());
    }
}
