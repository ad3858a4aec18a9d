//! Periodic run trigger.
//!
//! A plain interval loop: every tick attempts a run. If one is already in
//! flight the tick is a no-op, so a slow run never stacks triggers behind
//! itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::etl::Orchestrator;

/// Spawn the trigger loop. `interval_secs == 0` disables scheduling (runs
/// are then /refresh-only) and returns None.
pub fn spawn(
    orchestrator: Arc<Orchestrator>,
    interval_secs: u64,
    shutdown: Arc<AtomicBool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        info!("scheduler disabled, runs are trigger-only");
        return None;
    }

    info!(interval_secs, "scheduler starting");

    Some(tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("scheduler stopping");
                break;
            }
            if orchestrator.is_running() {
                debug!("run already in progress, scheduled trigger skipped");
                continue;
            }

            match orchestrator.run_etl().await {
                Ok(entry) => {
                    info!(
                        run_id = %entry.run_id,
                        status = entry.status.as_str(),
                        rows = entry.rows_processed(),
                        "scheduled run finished"
                    );
                }
                Err(e) => error!(error = %e, "scheduled run failed"),
            }
        }
    }))
}
