//! Periodic reconciliation.

use std::future::Future;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use vitals_core::Context;

use crate::reconcile::ReconcileJob;

/// Runs `job` every `period` until `shutdown` resolves.
///
/// The first run starts immediately. Failed runs are logged and do not stop
/// the loop; a run in progress when `shutdown` resolves is abandoned.
/// Returns the number of runs started.
pub async fn run_periodic<F>(job: &ReconcileJob, period: Duration, shutdown: F) -> u64
where
    F: Future<Output = ()>,
{
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut runs = 0_u64;
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {}
        }
        runs += 1;
        let ctx = Context::new("reconcile");
        tokio::select! {
            () = &mut shutdown => break,
            result = job.run(&ctx) => match result {
                Ok(summary) => {
                    if let Err(e) = summary.status() {
                        tracing::warn!(
                            run_id = %summary.run_id,
                            error = %e,
                            "reconciliation finished with errors"
                        );
                    }
                }
                Err(e) => tracing::error!(error = %e, "reconciliation run failed"),
            },
        }
    }
    tracing::info!(runs, "reconciliation scheduler stopped");
    runs
}
