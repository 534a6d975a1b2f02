use chrono::{DateTime, Utc};
use seatmap_shared::{EventId, SeatId, SeatRecord, SeatStatus};
use std::collections::BTreeMap;

use crate::repository::{SeatInventoryStore, StoreResult};

/// A seat as a buyer sees it right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatView {
    pub seat_id: SeatId,
    pub section: Option<String>,
    pub status: SeatStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl SeatView {
    pub fn of(record: &SeatRecord, now: DateTime<Utc>) -> Self {
        let status = record.effective_status(now);
        Self {
            seat_id: record.seat_id.clone(),
            section: record.section.clone(),
            status,
            expires_at: if status.is_hold() { record.expires_at() } else { None },
            version: record.version,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionCounts {
    pub total: usize,
    pub available: usize,
}

/// Snapshot of an event's seat map. Clients load this once and then apply
/// live changes whose version is newer than the seat's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatMap {
    pub event_id: EventId,
    pub seats: Vec<SeatView>,
    /// Keyed by section name; seats without one are counted under "".
    pub sections: BTreeMap<String, SectionCounts>,
    pub total: usize,
    pub available: usize,
}

impl SeatMap {
    pub async fn load(
        store: &dyn SeatInventoryStore,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> StoreResult<Self> {
        let records = store.list(event_id).await?;
        Ok(Self::from_records(event_id.clone(), &records, now))
    }

    pub fn from_records(event_id: EventId, records: &[SeatRecord], now: DateTime<Utc>) -> Self {
        let seats: Vec<SeatView> = records.iter().map(|r| SeatView::of(r, now)).collect();

        let mut sections: BTreeMap<String, SectionCounts> = BTreeMap::new();
        for seat in &seats {
            let counts = sections.entry(seat.section.clone().unwrap_or_default()).or_default();
            counts.total += 1;
            if seat.status == SeatStatus::Available {
                counts.available += 1;
            }
        }

        let available = seats.iter().filter(|s| s.status == SeatStatus::Available).count();
        Self {
            event_id,
            total: seats.len(),
            available,
            seats,
            sections,
        }
    }
}
