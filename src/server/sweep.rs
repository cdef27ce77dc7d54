//! Optional liveness sweep that closes silent links.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};

use super::registry::SessionRegistry;

/// Lower bound on the sweep period.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// Periodically closes links silent for longer than `timeout`.
///
/// Checks twice per `timeout`. Runs until the task is dropped.
pub async fn run_liveness_sweep(registry: Arc<SessionRegistry>, timeout: Duration) {
    let mut ticker = interval((timeout / 2).max(MIN_SWEEP_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(timeout_secs = timeout.as_secs(), "liveness sweep enabled");

    loop {
        ticker.tick().await;
        let evicted = registry.evict_stale(timeout).await;
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "silent links closed");
        }
    }
}
