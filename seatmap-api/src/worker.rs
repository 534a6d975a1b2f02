use std::sync::Arc;

use seatmap_core::{ExpiryReclaimer, ReservationManager};
use seatmap_store::app_config::ReclaimerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::metrics::SeatMetrics;

/// Run the expiry reclaimer on its own task until `shutdown` flips.
pub fn spawn_reclaimer(
    manager: Arc<ReservationManager>,
    config: &ReclaimerConfig,
    metrics: Arc<SeatMetrics>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let reclaimer = ExpiryReclaimer::new(manager, config.batch_size);
    let interval = config.interval();

    tokio::spawn(async move {
        reclaimer
            .run(interval, shutdown, move |report| {
                metrics.seats_reclaimed.inc_by(report.reclaimed as u64);
                if report.interrupted || report.failed > 0 {
                    warn!(
                        "Reclaimer sweep incomplete: {} failed, interrupted={}",
                        report.failed, report.interrupted
                    );
                }
            })
            .await;
    })
}
