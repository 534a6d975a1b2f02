use std::sync::Arc;
use std::time::Duration;

use seatmap_core::{EventBroadcaster, ReservationManager};
use seatmap_store::app_config::{GatewayConfig, ReservationConfig};

use crate::metrics::SeatMetrics;

/// Bounds on client-requested hold lengths.
#[derive(Debug, Clone, Copy)]
pub struct HoldLimits {
    pub default_ttl: chrono::Duration,
    pub max_ttl: chrono::Duration,
}

impl From<&ReservationConfig> for HoldLimits {
    fn from(config: &ReservationConfig) -> Self {
        let max_seconds = config.max_ttl_seconds.max(1);
        Self {
            default_ttl: chrono::Duration::seconds(config.default_ttl_seconds.clamp(1, max_seconds) as i64),
            max_ttl: chrono::Duration::seconds(max_seconds as i64),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ReservationManager>,
    pub metrics: Arc<SeatMetrics>,
    pub limits: HoldLimits,
    pub keepalive: Duration,
}

impl AppState {
    pub fn new(
        manager: Arc<ReservationManager>,
        metrics: Arc<SeatMetrics>,
        reservation: &ReservationConfig,
        gateway: &GatewayConfig,
    ) -> Self {
        Self {
            manager,
            metrics,
            limits: HoldLimits::from(reservation),
            keepalive: gateway.keepalive(),
        }
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        self.manager.broadcaster()
    }
}
