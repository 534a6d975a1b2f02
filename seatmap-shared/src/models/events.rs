use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::seat::{EventId, SeatId, SeatRecord, SeatStatus};

/// Published once per successful seat transition.
///
/// The holder token is intentionally absent: every viewer of the seat map
/// receives these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatChange {
    pub event_id: EventId,
    pub seat_id: SeatId,
    pub status: SeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl SeatChange {
    pub fn from_record(record: &SeatRecord) -> Self {
        Self {
            event_id: record.event_id.clone(),
            seat_id: record.seat_id.clone(),
            status: record.status(),
            expires_at: record.expires_at(),
            version: record.version,
        }
    }
}

/// The per-seat payload pushed to live seat-map clients.
#[derive(Debug, Clone, Serialize)]
pub struct SeatUpdateMessage<'a> {
    pub seat_id: &'a SeatId,
    pub status: SeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl<'a> From<&'a SeatChange> for SeatUpdateMessage<'a> {
    fn from(change: &'a SeatChange) -> Self {
        Self {
            seat_id: &change.seat_id,
            status: change.status,
            expires_at: change.expires_at,
            version: change.version,
        }
    }
}
