//! Periodic connection health check.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

use crate::coordinator::SyncCoordinator;
use crate::session::SessionManager;

/// Spawn the background task that reconciles the session manager's peer set
/// with the transport every `period`.
///
/// Peers discovered by reconciliation are caught up like any other newly
/// connected peer. Abort the returned handle to stop the task.
pub fn spawn_health_monitor(
    manager: Arc<SessionManager>,
    coordinator: Arc<SyncCoordinator>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Health monitor started (interval: {:?})", period);

        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the session was just set up.
        timer.tick().await;

        loop {
            timer.tick().await;

            let signals = manager.reconcile_health().await;
            if signals.is_empty() {
                tracing::trace!("Health check: bookkeeping matches transport");
            } else {
                tracing::debug!("Health check: {} peers adopted", signals.len());
                coordinator.handle_signals(signals).await;
            }
        }
    })
}
