//! Lazy stats population.
//!
//! [`StatsPopulator::populate`] fills a project's [`DerivedStats`] with a
//! cache-or-compute discipline:
//!
//! 1. Already populated: nothing to do.
//! 2. Not dirty: try the cache. A hit fills the stats without touching the
//!    event store. A cache fault (not a miss) aborts the call.
//! 3. Miss, undecodable entry, dirty project or invalidated entry: recompute
//!    from the event store and write the result back with the configured TTL.
//!
//! Only consulted lookups feed the hit and miss counters, so a dirty project
//! records neither.
//!
//! The populator never writes events or project records. All-time totals are
//! the reconciled totals plus the events reconciliation has not folded in yet.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use vitals_core::{
    Cache, Clock, Context, EventStore, Filter, Kind, Order, ProjectId, Query, Timestamp,
};

use crate::config::StatsConfig;
use crate::error::{Result, StatsError};
use crate::events::{self, COUNTED_FIELD, Countable, TIME_FIELD};
use crate::metrics;
use crate::project::{DerivedStats, Project};
use crate::score;

/// Cache entry holding a project's derived statistics.
///
/// Ingestion overwrites the entry with `dirty: true` to invalidate it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedStats {
    /// The statistics.
    #[serde(flatten)]
    pub stats: DerivedStats,
    /// Entry must not be served.
    #[serde(default)]
    pub dirty: bool,
}

/// Cache key of a project's derived statistics.
#[must_use]
pub fn cache_key(id: &ProjectId) -> String {
    format!("stats:{id}")
}

/// Computes derived statistics on demand.
pub struct StatsPopulator {
    store: Arc<dyn EventStore>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    config: StatsConfig,
}

impl std::fmt::Debug for StatsPopulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsPopulator")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StatsPopulator {
    /// Creates a populator.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        cache: Arc<dyn Cache>,
        clock: Arc<dyn Clock>,
        config: StatsConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Returns the clock used for window cutoffs.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Wraps a project so every stats accessor populates first.
    #[must_use]
    pub const fn live(&self, project: Project) -> LiveProject<'_> {
        LiveProject {
            populator: self,
            project,
        }
    }

    /// Ensures `project` carries derived statistics.
    ///
    /// On error the project is left unpopulated so the next access retries.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Cache`] on a cache fault during the lookup and
    /// [`StatsError::Store`] if any event store query fails. A failed cache
    /// write-back is logged, not returned.
    pub async fn populate(&self, ctx: &Context, project: &mut Project) -> Result<()> {
        if project.is_populated() {
            return Ok(());
        }
        let span = ctx.span("populate");
        async {
            if !project.is_dirty() {
                let cached = self.read_cache(ctx, &project.id).await?;
                metrics::record_cache_lookup(cached.is_some());
                if let Some(stats) = cached {
                    project.set_stats(stats);
                    return Ok(());
                }
            }

            let stats = self.compute(ctx, project).await.inspect_err(|e| {
                tracing::warn!(project = %project.id, error = %e, "stats recompute failed");
            })?;
            project.set_stats(stats);
            tracing::debug!(project = %project.id, ?stats, "stats recomputed");

            let entry = CachedStats {
                stats,
                dirty: false,
            };
            if let Err(e) = self.write_cache(ctx, &project.id, &entry).await {
                tracing::warn!(project = %project.id, error = %e, "stats cache write failed");
            }
            Ok::<(), StatsError>(())
        }
        .instrument(span)
        .await
    }

    /// Marks the cached statistics of `id` stale.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Cache`] if the cache write fails.
    pub async fn invalidate(&self, ctx: &Context, id: &ProjectId) -> Result<()> {
        let entry = CachedStats {
            stats: DerivedStats::default(),
            dirty: true,
        };
        self.write_cache(ctx, id, &entry).await
    }

    async fn read_cache(&self, ctx: &Context, id: &ProjectId) -> Result<Option<DerivedStats>> {
        let Some(blob) = self
            .cache
            .get(ctx, &cache_key(id))
            .await
            .map_err(StatsError::Cache)?
        else {
            return Ok(None);
        };
        match serde_json::from_slice::<CachedStats>(&blob) {
            Ok(entry) if !entry.dirty => Ok(Some(entry.stats)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!(
                    project = %id,
                    error = %e,
                    "discarding undecodable stats cache entry"
                );
                Ok(None)
            }
        }
    }

    async fn write_cache(&self, ctx: &Context, id: &ProjectId, entry: &CachedStats) -> Result<()> {
        let blob = serde_json::to_vec(entry)?;
        self.cache
            .set(ctx, &cache_key(id), Bytes::from(blob), self.config.cache_ttl())
            .await
            .map_err(StatsError::Cache)
    }

    async fn compute(&self, ctx: &Context, project: &Project) -> Result<DerivedStats> {
        let id = &project.id;
        let reconciled = &project.counters;
        let cutoff = self.clock.now().minus_secs(self.config.weekly_window_secs);
        let recent = || Filter::gt(TIME_FIELD, cutoff.as_micros());
        // Uncounted events older than the window are pruned, never counted.
        let pending = || Filter::eq(COUNTED_FIELD, false);

        let rating = self.count(ctx, events::for_project(Kind::Rating, id)).await?;
        let failures = self.count(ctx, events::for_project(Kind::Failure, id)).await?;

        let checkin_pending = self
            .count(
                ctx,
                events::for_project(Kind::Commit, id)
                    .filter(pending())
                    .filter(recent()),
            )
            .await?;
        let checkin_week = self
            .count(ctx, events::for_project(Kind::Commit, id).filter(recent()))
            .await?;
        let last_checkin = reconciled
            .last_checkin
            .max(self.newest(ctx, Kind::Commit, id).await?);

        let compile_pending = self
            .count(
                ctx,
                events::for_project(Kind::Compilation, id)
                    .filter(pending())
                    .filter(recent()),
            )
            .await?;
        let compile_week = self
            .count(ctx, events::for_project(Kind::Compilation, id).filter(recent()))
            .await?;
        let last_compile = reconciled
            .last_compile
            .max(self.newest(ctx, Kind::Compilation, id).await?);

        let compile_at_head = if last_checkin.is_zero() {
            0
        } else {
            self.count(
                ctx,
                events::for_project(Kind::Compilation, id)
                    .filter(Filter::gt(TIME_FIELD, last_checkin.as_micros())),
            )
            .await?
        };

        Ok(DerivedStats {
            rating,
            failures,
            compile_total: reconciled.compile_total + compile_pending,
            compile_week,
            compile_at_head,
            checkin_total: reconciled.checkin_total + checkin_pending,
            checkin_week,
            last_compile,
            last_checkin,
        })
    }

    async fn count(&self, ctx: &Context, query: Query) -> Result<u64> {
        self.store
            .count(ctx, &query)
            .await
            .map_err(StatsError::Store)
    }

    async fn newest(&self, ctx: &Context, kind: Kind, id: &ProjectId) -> Result<Timestamp> {
        let query = events::for_project(kind, id)
            .order(Order::desc(TIME_FIELD))
            .limit(1);
        let newest = self
            .store
            .query(ctx, query)
            .await
            .map_err(StatsError::Store)?
            .try_next()
            .await
            .map_err(StatsError::Store)?;
        match newest {
            Some(record) => Ok(Countable::from_stored(record)?.time),
            None => Ok(Timestamp::ZERO),
        }
    }
}

/// A project whose stats accessors populate on first use.
///
/// Callers never observe an unpopulated read: every accessor runs
/// [`StatsPopulator::populate`] first and fails if that fails.
#[derive(Debug)]
pub struct LiveProject<'a> {
    populator: &'a StatsPopulator,
    project: Project,
}

impl LiveProject<'_> {
    /// Returns the wrapped project.
    #[must_use]
    pub const fn project(&self) -> &Project {
        &self.project
    }

    /// Unwraps the project.
    #[must_use]
    pub fn into_inner(self) -> Project {
        self.project
    }

    /// Returns the full derived statistics.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn stats(&mut self, ctx: &Context) -> Result<DerivedStats> {
        self.populator.populate(ctx, &mut self.project).await?;
        self.project
            .stats()
            .copied()
            .ok_or_else(|| StatsError::internal("project unpopulated after populate"))
    }

    /// Rating votes.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn rating(&mut self, ctx: &Context) -> Result<u64> {
        Ok(self.stats(ctx).await?.rating)
    }

    /// Failure reports.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn failures(&mut self, ctx: &Context) -> Result<u64> {
        Ok(self.stats(ctx).await?.failures)
    }

    /// All-time builds.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn compile_total(&mut self, ctx: &Context) -> Result<u64> {
        Ok(self.stats(ctx).await?.compile_total)
    }

    /// Builds this week.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn compile_week(&mut self, ctx: &Context) -> Result<u64> {
        Ok(self.stats(ctx).await?.compile_week)
    }

    /// Builds newer than the latest commit.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn compile_at_head(&mut self, ctx: &Context) -> Result<u64> {
        Ok(self.stats(ctx).await?.compile_at_head)
    }

    /// All-time commits.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn checkin_total(&mut self, ctx: &Context) -> Result<u64> {
        Ok(self.stats(ctx).await?.checkin_total)
    }

    /// Commits this week.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn checkin_week(&mut self, ctx: &Context) -> Result<u64> {
        Ok(self.stats(ctx).await?.checkin_week)
    }

    /// Time since the newest build, as `"{days}d {hours}h"` or `"never"`.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn compile_elapsed(&mut self, ctx: &Context) -> Result<String> {
        let last = self.stats(ctx).await?.last_compile;
        Ok(last.elapsed_since(self.populator.clock.now()))
    }

    /// Time since the newest commit, as `"{days}d {hours}h"` or `"never"`.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn checkin_elapsed(&mut self, ctx: &Context) -> Result<String> {
        let last = self.stats(ctx).await?.last_checkin;
        Ok(last.elapsed_since(self.populator.clock.now()))
    }

    /// Quality score.
    ///
    /// # Errors
    ///
    /// Returns the population error, if any.
    pub async fn score(&mut self, ctx: &Context) -> Result<u8> {
        self.stats(ctx).await?;
        score::project_score(&self.project)
            .ok_or_else(|| StatsError::internal("project unpopulated after populate"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use ::metrics::{
        Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };

    use super::*;
    use vitals_core::{ManualClock, MemoryCache, MemoryEventStore};

    const NOW: i64 = 30 * 24 * vitals_core::clock::MICROS_PER_HOUR;

    struct Setup {
        store: MemoryEventStore,
        cache: MemoryCache,
        populator: StatsPopulator,
        project: Project,
        ctx: Context,
    }

    async fn setup() -> Setup {
        let store = MemoryEventStore::new();
        let cache = MemoryCache::new();
        let clock = Arc::new(ManualClock::new(Timestamp::from_micros(NOW)));
        let populator = StatsPopulator::new(
            Arc::new(store.clone()),
            Arc::new(cache.clone()),
            clock,
            StatsConfig::default(),
        );
        let project = Project::register("o", "widget", Timestamp::ZERO).unwrap();
        let ctx = Context::new("test");
        crate::project::save(&ctx, &store, &project).await.unwrap();
        Setup {
            store,
            cache,
            populator,
            project,
            ctx,
        }
    }

    async fn add(s: &Setup, kind: Kind, at: i64) {
        let event = Countable::ticked(kind, &s.project.id, Timestamp::from_micros(at));
        events::save(&s.ctx, &s.store, &event).await.unwrap();
    }

    #[tokio::test]
    async fn recompute_counts_pending_events() {
        let s = setup().await;
        add(&s, Kind::Commit, NOW - 100).await;
        add(&s, Kind::Compilation, NOW - 200).await;
        add(&s, Kind::Compilation, NOW - 50).await;
        add(&s, Kind::Compilation, NOW - 10).await;

        let mut project = s.project.clone();
        s.populator.populate(&s.ctx, &mut project).await.unwrap();
        let stats = project.stats().copied().unwrap();
        assert_eq!(stats.checkin_total, 1);
        assert_eq!(stats.checkin_week, 1);
        assert_eq!(stats.compile_total, 3);
        assert_eq!(stats.compile_at_head, 2);
        assert_eq!(stats.last_checkin, Timestamp::from_micros(NOW - 100));
        assert_eq!(stats.last_compile, Timestamp::from_micros(NOW - 10));
        assert!(!s.cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn no_commit_means_no_builds_at_head() {
        let s = setup().await;
        add(&s, Kind::Compilation, NOW - 10).await;
        let mut live = s.populator.live(s.project.clone());
        assert_eq!(live.compile_at_head(&s.ctx).await.unwrap(), 0);
        assert_eq!(live.compile_total(&s.ctx).await.unwrap(), 1);
        assert_eq!(live.checkin_elapsed(&s.ctx).await.unwrap(), "never");
        assert_eq!(live.compile_elapsed(&s.ctx).await.unwrap(), "0d 0h");
    }

    #[tokio::test]
    async fn cache_hit_skips_recompute() {
        let s = setup().await;
        let mut first = s.project.clone();
        s.populator.populate(&s.ctx, &mut first).await.unwrap();

        add(&s, Kind::Commit, NOW - 1).await;
        let mut second = s.project.clone();
        s.populator.populate(&s.ctx, &mut second).await.unwrap();
        assert_eq!(second.stats().unwrap().checkin_total, 0);

        second.mark_dirty();
        s.populator.populate(&s.ctx, &mut second).await.unwrap();
        assert_eq!(second.stats().unwrap().checkin_total, 1);
    }

    #[tokio::test]
    async fn invalidated_entry_forces_recompute() {
        let s = setup().await;
        let mut first = s.project.clone();
        s.populator.populate(&s.ctx, &mut first).await.unwrap();

        add(&s, Kind::Commit, NOW - 1).await;
        s.populator.invalidate(&s.ctx, &s.project.id).await.unwrap();

        let mut second = s.project.clone();
        s.populator.populate(&s.ctx, &mut second).await.unwrap();
        assert_eq!(second.stats().unwrap().checkin_total, 1);
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss() {
        let s = setup().await;
        s.cache
            .set(
                &s.ctx,
                &cache_key(&s.project.id),
                Bytes::from_static(b"not json"),
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap();
        let mut project = s.project.clone();
        s.populator.populate(&s.ctx, &mut project).await.unwrap();
        assert!(project.is_populated());
    }

    #[tokio::test]
    async fn cache_fault_aborts_population() {
        let s = setup().await;
        s.cache.set_failing(true);
        let mut project = s.project.clone();
        let err = s.populator.populate(&s.ctx, &mut project).await.unwrap_err();
        assert!(matches!(err, StatsError::Cache(_)));
        assert!(!project.is_populated());
    }

    #[derive(Default)]
    struct CountingRecorder {
        counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
    }

    impl CountingRecorder {
        fn value(&self, name: &str) -> u64 {
            self.counters
                .lock()
                .unwrap()
                .get(name)
                .map_or(0, |c| c.load(Ordering::Relaxed))
        }
    }

    impl Recorder for CountingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            let mut counters = self.counters.lock().unwrap();
            let counter = counters.entry(key.name().to_string()).or_default();
            Counter::from_arc(Arc::clone(counter))
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn only_consulted_lookups_are_counted() {
        let recorder = CountingRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            futures::executor::block_on(async {
                let s = setup().await;
                let mut cold = s.project.clone();
                s.populator.populate(&s.ctx, &mut cold).await.unwrap();
                let mut warm = s.project.clone();
                s.populator.populate(&s.ctx, &mut warm).await.unwrap();

                let mut dirty = s.project.clone();
                dirty.mark_dirty();
                s.populator.populate(&s.ctx, &mut dirty).await.unwrap();
                assert!(dirty.is_populated());
            });
        });
        assert_eq!(recorder.value(crate::metrics::CACHE_MISSES), 1);
        assert_eq!(recorder.value(crate::metrics::CACHE_HITS), 1);
    }

    #[tokio::test]
    async fn reconciled_totals_are_the_base() {
        let s = setup().await;
        let mut project = s.project.clone();
        project.counters.checkin_total = 10;
        project.counters.last_checkin = Timestamp::from_micros(NOW - 5);
        add(&s, Kind::Commit, NOW - 50).await;

        s.populator.populate(&s.ctx, &mut project).await.unwrap();
        let stats = project.stats().unwrap();
        assert_eq!(stats.checkin_total, 11);
        assert_eq!(stats.last_checkin, Timestamp::from_micros(NOW - 5));
    }
}
