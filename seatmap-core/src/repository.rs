use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatmap_shared::{EventId, SeatId, SeatRecord, SeatState};
use std::sync::Arc;

/// Failures of the seat inventory store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Seat not found: {event_id}/{seat_id}")]
    NotFound { event_id: EventId, seat_id: SeatId },

    /// The record changed since the caller read it.
    #[error("Version conflict on {event_id}/{seat_id}: expected {expected}, found {actual}")]
    Conflict {
        event_id: EventId,
        seat_id: SeatId,
        expected: u64,
        actual: u64,
    },

    /// The backing storage could not be reached or returned garbage.
    #[error("Seat store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(event_id: &EventId, seat_id: &SeatId) -> Self {
        StoreError::NotFound {
            event_id: event_id.clone(),
            seat_id: seat_id.clone(),
        }
    }

    pub fn conflict(event_id: &EventId, seat_id: &SeatId, expected: u64, actual: u64) -> Self {
        StoreError::Conflict {
            event_id: event_id.clone(),
            seat_id: seat_id.clone(),
            expected,
            actual,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Opaque resume point of an expired-hold scan. Each backend decides what it
/// encodes; callers only hand it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor(pub String);

const KEY_SEPARATOR: char = '\u{1f}';

impl ScanCursor {
    /// Cursor for backends that page by `(event_id, seat_id)`.
    pub fn after_seat(event_id: &EventId, seat_id: &SeatId) -> Self {
        ScanCursor(format!("{}{}{}", event_id, KEY_SEPARATOR, seat_id))
    }

    /// Inverse of [`ScanCursor::after_seat`].
    pub fn seat_key(&self) -> StoreResult<(EventId, SeatId)> {
        self.0
            .split_once(KEY_SEPARATOR)
            .map(|(event, seat)| (EventId::new(event), SeatId::new(seat)))
            .ok_or_else(|| StoreError::Unavailable(format!("malformed scan cursor: {:?}", self.0)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExpiredPage {
    pub records: Vec<SeatRecord>,
    /// `None` once the scan is exhausted.
    pub next: Option<ScanCursor>,
}

/// A seat to create when an event's seat map is provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSeat {
    pub seat_id: SeatId,
    pub section: Option<String>,
}

impl NewSeat {
    /// A rectangular block: rows `A`, `B`, ... `Z`, `AA`, ... each holding
    /// seats numbered from 1, so ids read `A1`, `A2`, ..., `B1`.
    pub fn grid(section: Option<&str>, rows: u32, seats_per_row: u32) -> Vec<NewSeat> {
        let mut seats = Vec::with_capacity((rows as usize) * (seats_per_row as usize));
        for row in 0..rows {
            let label = row_label(row);
            for number in 1..=seats_per_row {
                seats.push(NewSeat {
                    seat_id: SeatId::new(format!("{}{}", label, number)),
                    section: section.map(str::to_string),
                });
            }
        }
        seats
    }
}

fn row_label(mut index: u32) -> String {
    let mut label = Vec::new();
    loop {
        label.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}

/// Authoritative storage of seat records.
///
/// `compare_and_set` is the only mutation of existing seats. It must be
/// atomic per seat: the write lands only if the stored version still equals
/// `expected_version`, and the stored version then becomes
/// `expected_version + 1`.
#[async_trait]
pub trait SeatInventoryStore: Send + Sync {
    async fn get(&self, event_id: &EventId, seat_id: &SeatId) -> StoreResult<SeatRecord>;

    async fn compare_and_set(
        &self,
        event_id: &EventId,
        seat_id: &SeatId,
        expected_version: u64,
        next: SeatState,
    ) -> StoreResult<u64>;

    /// One page of RESERVED/LOCKED records with `expires_at <= now`, resuming
    /// after `cursor`.
    async fn scan_expired_page(
        &self,
        now: DateTime<Utc>,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> StoreResult<ExpiredPage>;

    /// Every seat of an event, ordered by seat id.
    async fn list(&self, event_id: &EventId) -> StoreResult<Vec<SeatRecord>>;

    /// Create AVAILABLE seats; seats that already exist are left as they are.
    /// Returns how many were inserted.
    async fn provision(&self, event_id: &EventId, seats: &[NewSeat]) -> StoreResult<usize>;
}

/// Lazy walk over every expired hold, one page at a time.
///
/// The scan is finite (it ends once a page comes back without a cursor) and can be
/// resumed from [`ExpiredScan::cursor`] with [`ExpiredScan::resume`].
pub struct ExpiredScan {
    store: Arc<dyn SeatInventoryStore>,
    now: DateTime<Utc>,
    batch_size: usize,
    cursor: Option<ScanCursor>,
    done: bool,
}

impl ExpiredScan {
    pub fn new(store: Arc<dyn SeatInventoryStore>, now: DateTime<Utc>, batch_size: usize) -> Self {
        Self::resume(store, now, batch_size, None)
    }

    pub fn resume(
        store: Arc<dyn SeatInventoryStore>,
        now: DateTime<Utc>,
        batch_size: usize,
        cursor: Option<ScanCursor>,
    ) -> Self {
        Self {
            store,
            now,
            batch_size: batch_size.max(1),
            cursor,
            done: false,
        }
    }

    pub fn cursor(&self) -> Option<&ScanCursor> {
        self.cursor.as_ref()
    }

    /// Next non-empty batch, or `Ok(None)` when the scan is exhausted. On
    /// error the cursor is unchanged, so calling again retries the same page.
    pub async fn next_batch(&mut self) -> StoreResult<Option<Vec<SeatRecord>>> {
        while !self.done {
            let page = self
                .store
                .scan_expired_page(self.now, self.cursor.as_ref(), self.batch_size)
                .await?;

            match page.next {
                Some(next) => self.cursor = Some(next),
                None => self.done = true,
            }

            // A backend may filter a page down to nothing and still have more.
            if !page.records.is_empty() {
                return Ok(Some(page.records));
            }
        }
        Ok(None)
    }
}
