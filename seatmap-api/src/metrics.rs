use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use seatmap_core::{OutcomeCode, SeatOutcome};

/// Process metrics, exported at `GET /metrics`.
pub struct SeatMetrics {
    registry: Registry,
    pub seat_operations: IntCounterVec,
    pub seats_reclaimed: IntCounter,
    pub live_subscribers: IntGauge,
    pub notifications_lagged: IntCounter,
}

impl SeatMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("seatmap".into()), None)?;

        let seat_operations = IntCounterVec::new(
            Opts::new("seat_operations_total", "Per-seat reservation operations by outcome"),
            &["operation", "outcome"],
        )?;
        let seats_reclaimed = IntCounter::new("seats_reclaimed_total", "Expired holds returned to AVAILABLE")?;
        let live_subscribers = IntGauge::new("live_subscribers", "Open live seat-map streams")?;
        let notifications_lagged = IntCounter::new(
            "notifications_lagged_total",
            "Seat changes dropped from full subscriber queues",
        )?;

        registry.register(Box::new(seat_operations.clone()))?;
        registry.register(Box::new(seats_reclaimed.clone()))?;
        registry.register(Box::new(live_subscribers.clone()))?;
        registry.register(Box::new(notifications_lagged.clone()))?;

        Ok(Self {
            registry,
            seat_operations,
            seats_reclaimed,
            live_subscribers,
            notifications_lagged,
        })
    }

    pub fn record_outcomes(&self, operation: &str, outcomes: &[SeatOutcome]) {
        for outcome in outcomes {
            self.record(operation, outcome.code);
        }
    }

    pub fn record(&self, operation: &str, code: OutcomeCode) {
        self.seat_operations.with_label_values(&[operation, code.as_str()]).inc();
    }

    /// Prometheus text exposition of everything registered.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
