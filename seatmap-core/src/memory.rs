use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use seatmap_shared::{EventId, SeatId, SeatRecord, SeatState};

use crate::repository::{
    ExpiredPage, NewSeat, ScanCursor, SeatInventoryStore, StoreError, StoreResult,
};

type SeatKey = (EventId, SeatId);

/// Process-local seat store.
///
/// Each compare-and-set holds the lock of a single map shard for the
/// duration of the version check and write, so seats never wait on each
/// other beyond shard collisions.
#[derive(Default)]
pub struct InMemorySeatStore {
    seats: DashMap<SeatKey, SeatRecord>,
}

impl InMemorySeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }
}

#[async_trait]
impl SeatInventoryStore for InMemorySeatStore {
    async fn get(&self, event_id: &EventId, seat_id: &SeatId) -> StoreResult<SeatRecord> {
        self.seats
            .get(&(event_id.clone(), seat_id.clone()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::not_found(event_id, seat_id))
    }

    async fn compare_and_set(
        &self,
        event_id: &EventId,
        seat_id: &SeatId,
        expected_version: u64,
        next: SeatState,
    ) -> StoreResult<u64> {
        let mut entry = self
            .seats
            .get_mut(&(event_id.clone(), seat_id.clone()))
            .ok_or_else(|| StoreError::not_found(event_id, seat_id))?;

        if entry.version != expected_version {
            return Err(StoreError::conflict(event_id, seat_id, expected_version, entry.version));
        }

        entry.state = next;
        entry.version += 1;
        Ok(entry.version)
    }

    async fn scan_expired_page(
        &self,
        now: DateTime<Utc>,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> StoreResult<ExpiredPage> {
        let after = cursor.map(ScanCursor::seat_key).transpose()?;

        let mut expired: Vec<SeatRecord> = self
            .seats
            .iter()
            .filter(|entry| entry.value().is_expired_hold(now))
            .filter(|entry| after.as_ref().map_or(true, |after| entry.key() > after))
            .map(|entry| entry.value().clone())
            .collect();

        expired.sort_by(|a, b| (&a.event_id, &a.seat_id).cmp(&(&b.event_id, &b.seat_id)));

        let has_more = expired.len() > limit;
        expired.truncate(limit);

        let next = match expired.last() {
            Some(last) if has_more => Some(ScanCursor::after_seat(&last.event_id, &last.seat_id)),
            _ => None,
        };

        Ok(ExpiredPage { records: expired, next })
    }

    async fn list(&self, event_id: &EventId) -> StoreResult<Vec<SeatRecord>> {
        let mut seats: Vec<SeatRecord> = self
            .seats
            .iter()
            .filter(|entry| &entry.key().0 == event_id)
            .map(|entry| entry.value().clone())
            .collect();
        seats.sort_by(|a, b| a.seat_id.cmp(&b.seat_id));
        Ok(seats)
    }

    async fn provision(&self, event_id: &EventId, seats: &[NewSeat]) -> StoreResult<usize> {
        let mut inserted = 0;
        for seat in seats {
            self.seats
                .entry((event_id.clone(), seat.seat_id.clone()))
                .or_insert_with(|| {
                    inserted += 1;
                    SeatRecord::provisioned(event_id.clone(), seat.seat_id.clone(), seat.section.clone())
                });
        }
        Ok(inserted)
    }
}
