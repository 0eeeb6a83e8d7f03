//! Background expiry sweep.

use crate::coordinator::UploadCoordinator;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawn the periodic expiry sweep.
///
/// Returns `None` when `interval` is zero. The task stops when `shutdown` is
/// cancelled; a failed sweep is logged and retried on the next tick.
pub fn spawn_sweeper(
    coordinator: UploadCoordinator,
    interval: Duration,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        tracing::info!("Expiry sweeper disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "Expiry sweeper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Expiry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match coordinator.sweep_expired(OffsetDateTime::now_utc()).await {
                        Ok(stats) if stats.deleted > 0 || stats.errors > 0 => {
                            tracing::info!(
                                scanned = stats.scanned,
                                deleted = stats.deleted,
                                errors = stats.errors,
                                "Expiry sweep finished"
                            );
                        }
                        Ok(_) => tracing::debug!("Expiry sweep found nothing to remove"),
                        Err(e) => tracing::error!(error = %e, "Expiry sweep failed"),
                    }
                }
            }
        }
    }))
}
