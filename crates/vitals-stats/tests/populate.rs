//! Stats population integration tests: cache discipline and derived values.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use vitals_core::clock::MICROS_PER_HOUR;
use vitals_core::{Kind, Timestamp};
use vitals_stats::project::ProjectCounters;
use vitals_stats::score::MAX_SCORE;
use vitals_stats::StatsError;
use vitals_test_utils::{
    OpKind, ProjectFactory, StatsHarness, assert_no_store_reads, init_test_logging,
    populated_stats,
};

fn hours_ago(h: &StatsHarness, hours: i64) -> Timestamp {
    Timestamp::from_micros(h.now().as_micros() - hours * MICROS_PER_HOUR)
}

#[tokio::test]
async fn fresh_cache_entry_is_served_without_store_reads() {
    init_test_logging();
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    h.seed_event(Kind::Commit, &project.id, hours_ago(&h, 1), false)
        .await;
    let first = populated_stats(&h.populated(&project.id).await);

    let mut again = h.load(&project.id).await;
    h.store.clear_operations();
    h.populator
        .populate(&h.ctx(), &mut again)
        .await
        .expect("populate");
    assert_no_store_reads(&h.store);
    assert_eq!(populated_stats(&again), first);
}

#[tokio::test]
async fn populated_project_is_not_recomputed() {
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    let mut populated = h.populated(&project.id).await;
    h.store.clear_operations();
    h.cache.set_failing(true);

    h.populator
        .populate(&h.ctx(), &mut populated)
        .await
        .expect("no-op populate");
    assert!(h.store.operations().is_empty());
}

#[tokio::test]
async fn dirty_project_bypasses_the_cache() {
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    h.seed_event(Kind::Commit, &project.id, hours_ago(&h, 2), false)
        .await;
    assert_eq!(populated_stats(&h.populated(&project.id).await).checkin_total, 1);

    h.seed_event(Kind::Commit, &project.id, hours_ago(&h, 1), false)
        .await;
    // Still served from the cache.
    assert_eq!(populated_stats(&h.populated(&project.id).await).checkin_total, 1);

    let mut project = h.load(&project.id).await;
    project.mark_dirty();
    h.populator
        .populate(&h.ctx(), &mut project)
        .await
        .expect("populate");
    assert!(!project.is_dirty());
    assert!(h.store.count_of(OpKind::Count) > 0);
    assert_eq!(populated_stats(&project).checkin_total, 2);

    // The recompute was written back.
    h.store.clear_operations();
    assert_eq!(populated_stats(&h.populated(&project.id).await).checkin_total, 2);
    assert_eq!(h.store.count_of(OpKind::Count), 0);
}

#[tokio::test]
async fn invalidated_entry_is_recomputed() {
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    h.populated(&project.id).await;
    h.seed_vote(Kind::Rating, &project.id, "10.0.0.1").await;

    h.populator
        .invalidate(&h.ctx(), &project.id)
        .await
        .expect("invalidate");
    assert_eq!(populated_stats(&h.populated(&project.id).await).rating, 1);
}

#[tokio::test]
async fn cache_fault_aborts_population() {
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    h.cache.set_failing(true);

    let mut project = h.load(&project.id).await;
    let err = h
        .populator
        .populate(&h.ctx(), &mut project)
        .await
        .expect_err("cache fault");
    assert!(matches!(err, StatsError::Cache(_)), "unexpected error: {err}");
    assert!(!project.is_populated());
}

#[tokio::test]
async fn store_failure_leaves_project_unpopulated_until_retry() {
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    h.store.inject_op_failure(OpKind::Count, "rating/");

    let mut project = h.load(&project.id).await;
    let err = h
        .populator
        .populate(&h.ctx(), &mut project)
        .await
        .expect_err("store failure");
    assert!(matches!(err, StatsError::Store(_)), "unexpected error: {err}");
    assert!(!project.is_populated());

    h.store.clear_failures();
    h.populator
        .populate(&h.ctx(), &mut project)
        .await
        .expect("retry");
    assert!(project.is_populated());
}

#[tokio::test]
async fn totals_add_pending_events_to_reconciled_counts() {
    let h = StatsHarness::new();
    let reconciled_checkin = hours_ago(&h, 10);
    let project = ProjectFactory::with_counters(
        "widget",
        ProjectCounters {
            checkin_total: 10,
            compile_total: 4,
            last_checkin: reconciled_checkin,
            ..ProjectCounters::default()
        },
    );
    h.save_project(&project).await;
    h.seed_event(Kind::Commit, &project.id, hours_ago(&h, 9), true)
        .await;
    h.seed_event(Kind::Commit, &project.id, hours_ago(&h, 2), false)
        .await;
    h.seed_event(Kind::Commit, &project.id, hours_ago(&h, 1), false)
        .await;
    // Uncounted but already outside the window: never counted.
    h.seed_event(Kind::Commit, &project.id, h.secs_ago(8 * 24 * 60 * 60), false)
        .await;
    h.seed_event(Kind::Compilation, &project.id, hours_ago(&h, 3), false)
        .await;

    let stats = populated_stats(&h.populated(&project.id).await);
    assert_eq!(stats.checkin_total, 12);
    assert_eq!(stats.checkin_week, 3);
    assert_eq!(stats.last_checkin, hours_ago(&h, 1));
    assert_eq!(stats.compile_total, 5);
    assert_eq!(stats.compile_week, 1);
    assert_eq!(stats.last_compile, hours_ago(&h, 3));
    // The only build predates the newest commit.
    assert_eq!(stats.compile_at_head, 0);
}

#[tokio::test]
async fn votes_count_once_per_submitter() {
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    for submitter in ["10.0.0.1", "10.0.0.1", "10.0.0.2", "", "devel"] {
        h.seed_vote(Kind::Rating, &project.id, submitter).await;
    }
    h.seed_vote(Kind::Failure, &project.id, "10.0.0.1").await;

    let stats = populated_stats(&h.populated(&project.id).await);
    assert_eq!(stats.rating, 3);
    assert_eq!(stats.failures, 1);
}

#[tokio::test]
async fn live_accessors_populate_on_first_use() {
    let h = StatsHarness::new();
    let project = ProjectFactory::with_urls("widget");
    h.save_project(&project).await;
    h.seed_event(Kind::Commit, &project.id, hours_ago(&h, 26), false)
        .await;
    h.seed_event(Kind::Compilation, &project.id, hours_ago(&h, 3), false)
        .await;

    let ctx = h.ctx();
    let mut live = h.populator.live(h.load(&project.id).await);
    assert!(!live.project().is_populated());
    assert_eq!(live.checkin_total(&ctx).await.unwrap(), 1);
    assert!(live.project().is_populated());
    assert_eq!(live.checkin_week(&ctx).await.unwrap(), 1);
    assert_eq!(live.compile_total(&ctx).await.unwrap(), 1);
    assert_eq!(live.compile_week(&ctx).await.unwrap(), 1);
    assert_eq!(live.compile_at_head(&ctx).await.unwrap(), 1);
    assert_eq!(live.rating(&ctx).await.unwrap(), 0);
    assert_eq!(live.failures(&ctx).await.unwrap(), 0);
    assert_eq!(live.checkin_elapsed(&ctx).await.unwrap(), "1d 2h");
    assert_eq!(live.compile_elapsed(&ctx).await.unwrap(), "0d 3h");

    // Urls and no failures: two points.
    let score = live.score(&ctx).await.unwrap();
    assert_eq!(score, 2);
    assert!(score <= MAX_SCORE);
}

#[tokio::test]
async fn live_accessor_reports_population_failure() {
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    h.cache.set_failing(true);

    let ctx = h.ctx();
    let mut live = h.populator.live(h.load(&project.id).await);
    assert!(matches!(
        live.rating(&ctx).await,
        Err(StatsError::Cache(_))
    ));
    assert!(!live.into_inner().is_populated());
}

#[tokio::test]
async fn weekly_window_is_strict_on_the_cutoff() {
    let h = StatsHarness::new();
    let project = h.register("widget").await;
    let cutoff = h.secs_ago(h.config.weekly_window_secs);
    for offset in [-1, 0, 1] {
        let at = Timestamp::from_micros(cutoff.as_micros() + offset);
        h.seed_event(Kind::Commit, &project.id, at, false).await;
    }

    let stats = populated_stats(&h.populated(&project.id).await);
    assert_eq!(stats.checkin_week, 1);
    // Pending events outside the window never reach the total.
    assert_eq!(stats.checkin_total, 1);
    assert_eq!(stats.last_checkin, Timestamp::from_micros(cutoff.as_micros() + 1));
}
