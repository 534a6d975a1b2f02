//! The seat state machine.
//!
//! ```text
//! AVAILABLE --reserve--> RESERVED --lock--> LOCKED
//! RESERVED|LOCKED --extend--> same status, new deadline
//! RESERVED|LOCKED --release | expiry--> AVAILABLE
//! RESERVED|LOCKED --confirm_sale--> SOLD
//! ```
//!
//! Every per-seat operation is read, decide, compare-and-set. A lost
//! compare-and-set is retried a bounded number of times and then reported
//! as `CONFLICT`. Expired holds are treated as available at read time, so
//! correctness never depends on the reclaimer having run.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rand::Rng;
use seatmap_shared::{EventId, HolderToken, SeatChange, SeatId, SeatRecord, SeatState, SeatStatus};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::broadcast::EventBroadcaster;
use crate::clock::Clock;
use crate::repository::{NewSeat, SeatInventoryStore, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Reserve,
    Extend,
    Lock,
    Release,
    ConfirmSale,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Reserve => "reserve",
            Operation::Extend => "extend",
            Operation::Lock => "lock",
            Operation::Release => "release",
            Operation::ConfirmSale => "confirm_sale",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    Ok,
    /// Seat unavailable, held by someone else, or contention outlasted the
    /// retry budget.
    Conflict,
    /// The caller does not hold the seat.
    Forbidden,
    /// Unknown seat, or the caller's hold has already expired.
    NotFound,
    /// The seat's status does not allow the operation.
    InvalidState,
    StoreUnavailable,
}

impl OutcomeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCode::Ok => "OK",
            OutcomeCode::Conflict => "CONFLICT",
            OutcomeCode::Forbidden => "FORBIDDEN",
            OutcomeCode::NotFound => "NOT_FOUND",
            OutcomeCode::InvalidState => "INVALID_STATE",
            OutcomeCode::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one operation on one seat.
///
/// On `OK` the status/expiry/version describe the seat after the operation.
/// On `CONFLICT`, `FORBIDDEN` and `INVALID_STATE` they describe the state that
/// blocked it (as buyers see it, so an expired hold reads as AVAILABLE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatOutcome {
    pub seat_id: SeatId,
    pub code: OutcomeCode,
    pub status: Option<SeatStatus>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: Option<u64>,
}

impl SeatOutcome {
    fn bare(seat_id: &SeatId, code: OutcomeCode) -> Self {
        Self {
            seat_id: seat_id.clone(),
            code,
            status: None,
            expires_at: None,
            version: None,
        }
    }

    fn describing(record: &SeatRecord, code: OutcomeCode, now: DateTime<Utc>) -> Self {
        let status = record.effective_status(now);
        Self {
            seat_id: record.seat_id.clone(),
            code,
            status: Some(status),
            expires_at: if status.is_hold() { record.expires_at() } else { None },
            version: Some(record.version),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == OutcomeCode::Ok
    }
}

#[derive(Debug, Clone)]
pub struct ReservationPolicy {
    /// Compare-and-set attempts per seat before giving up with `CONFLICT`.
    pub max_attempts: u32,
    /// Base pause between attempts; grows linearly and gets random jitter.
    pub retry_backoff: std::time::Duration,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: std::time::Duration::from_millis(10),
        }
    }
}

/// What the reclaimer did with one expired record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Reclaimed { version: u64 },
    /// The hold was extended, released or sold since it was scanned.
    Skipped,
    Failed(StoreError),
}

enum Decision {
    Write(SeatState),
    Done(SeatOutcome),
}

/// Sole writer of seat state.
pub struct ReservationManager {
    store: Arc<dyn SeatInventoryStore>,
    broadcaster: Arc<EventBroadcaster>,
    clock: Arc<dyn Clock>,
    policy: ReservationPolicy,
}

impl ReservationManager {
    pub fn new(
        store: Arc<dyn SeatInventoryStore>,
        broadcaster: Arc<EventBroadcaster>,
        clock: Arc<dyn Clock>,
        policy: ReservationPolicy,
    ) -> Self {
        Self {
            store,
            broadcaster,
            clock,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn SeatInventoryStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Place a soft hold on each seat. Seats are independent: a caller that
    /// needs all-or-nothing must release the seats that did succeed.
    pub async fn reserve(
        &self,
        event_id: &EventId,
        seat_ids: &[SeatId],
        holder: &HolderToken,
        ttl: Duration,
    ) -> Vec<SeatOutcome> {
        let mut outcomes = Vec::with_capacity(seat_ids.len());
        for seat_id in dedupe(seat_ids) {
            let outcome = self
                .apply(Operation::Reserve, event_id, seat_id, |record, now| {
                    if record.status() == SeatStatus::Available || record.is_expired_hold(now) {
                        Decision::Write(SeatState::reserved(holder.clone(), hold_deadline(now, ttl)))
                    } else {
                        Decision::Done(SeatOutcome::describing(record, OutcomeCode::Conflict, now))
                    }
                })
                .await;
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Push the deadline of the caller's live holds out to `now + ttl`. A
    /// deadline already past that point is left alone.
    pub async fn extend(
        &self,
        event_id: &EventId,
        seat_ids: &[SeatId],
        holder: &HolderToken,
        ttl: Duration,
    ) -> Vec<SeatOutcome> {
        let mut outcomes = Vec::with_capacity(seat_ids.len());
        for seat_id in dedupe(seat_ids) {
            let outcome = self
                .apply(Operation::Extend, event_id, seat_id, |record, now| {
                    match check_live_hold(record, holder, now, OutcomeCode::NotFound) {
                        Err(outcome) => Decision::Done(outcome),
                        Ok(()) => {
                            let deadline = hold_deadline(now, ttl);
                            match record.expires_at() {
                                Some(current) if current >= deadline => {
                                    Decision::Done(SeatOutcome::describing(record, OutcomeCode::Ok, now))
                                }
                                _ if record.status() == SeatStatus::Locked => {
                                    Decision::Write(SeatState::locked(holder.clone(), deadline))
                                }
                                _ => Decision::Write(SeatState::reserved(holder.clone(), deadline)),
                            }
                        }
                    }
                })
                .await;
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Move the caller's RESERVED seats into checkout. With `ttl` the deadline
    /// is pushed out as by `extend`, otherwise the current one is kept.
    pub async fn lock(
        &self,
        event_id: &EventId,
        seat_ids: &[SeatId],
        holder: &HolderToken,
        ttl: Option<Duration>,
    ) -> Vec<SeatOutcome> {
        let mut outcomes = Vec::with_capacity(seat_ids.len());
        for seat_id in dedupe(seat_ids) {
            let outcome = self
                .apply(Operation::Lock, event_id, seat_id, |record, now| {
                    if let Err(outcome) = check_live_hold(record, holder, now, OutcomeCode::InvalidState) {
                        return Decision::Done(outcome);
                    }
                    match (record.status(), ttl, record.expires_at()) {
                        (status, Some(ttl), current) => {
                            let deadline = hold_deadline(now, ttl);
                            let deadline = current.map_or(deadline, |current| current.max(deadline));
                            if status == SeatStatus::Locked && current == Some(deadline) {
                                Decision::Done(SeatOutcome::describing(record, OutcomeCode::Ok, now))
                            } else {
                                Decision::Write(SeatState::locked(holder.clone(), deadline))
                            }
                        }
                        (SeatStatus::Locked, None, _) => {
                            Decision::Done(SeatOutcome::describing(record, OutcomeCode::Ok, now))
                        }
                        (_, None, Some(current)) => Decision::Write(SeatState::locked(holder.clone(), current)),
                        (_, None, None) => {
                            Decision::Done(SeatOutcome::describing(record, OutcomeCode::InvalidState, now))
                        }
                    }
                })
                .await;
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Give the caller's holds back. Releasing a seat that is already
    /// available (or whose foreign hold has lapsed) succeeds without a write.
    pub async fn release(
        &self,
        event_id: &EventId,
        seat_ids: &[SeatId],
        holder: &HolderToken,
    ) -> Vec<SeatOutcome> {
        let mut outcomes = Vec::with_capacity(seat_ids.len());
        for seat_id in dedupe(seat_ids) {
            let outcome = self
                .apply(Operation::Release, event_id, seat_id, |record, now| match record.status() {
                    SeatStatus::Available => {
                        Decision::Done(SeatOutcome::describing(record, OutcomeCode::Ok, now))
                    }
                    SeatStatus::Sold => {
                        Decision::Done(SeatOutcome::describing(record, OutcomeCode::InvalidState, now))
                    }
                    SeatStatus::Reserved | SeatStatus::Locked => {
                        if record.is_held_by(holder) {
                            Decision::Write(SeatState::available())
                        } else if record.is_expired_hold(now) {
                            Decision::Done(SeatOutcome::describing(record, OutcomeCode::Ok, now))
                        } else {
                            Decision::Done(SeatOutcome::describing(record, OutcomeCode::Forbidden, now))
                        }
                    }
                })
                .await;
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Turn the caller's live holds into sales. An expired hold cannot be
    /// sold; the caller has to reserve again.
    pub async fn confirm_sale(
        &self,
        event_id: &EventId,
        seat_ids: &[SeatId],
        holder: &HolderToken,
    ) -> Vec<SeatOutcome> {
        let mut outcomes = Vec::with_capacity(seat_ids.len());
        for seat_id in dedupe(seat_ids) {
            let outcome = self
                .apply(Operation::ConfirmSale, event_id, seat_id, |record, now| {
                    match check_live_hold(record, holder, now, OutcomeCode::InvalidState) {
                        Ok(()) => Decision::Write(SeatState::sold(holder.clone())),
                        Err(outcome) => Decision::Done(outcome),
                    }
                })
                .await;
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Return an expired hold to AVAILABLE, but only if the seat is still at
    /// the version the scan observed. Never retried.
    pub async fn reclaim(&self, observed: &SeatRecord) -> ReclaimOutcome {
        let now = self.clock.now();
        if !observed.is_expired_hold(now) {
            return ReclaimOutcome::Skipped;
        }

        match self
            .store
            .compare_and_set(&observed.event_id, &observed.seat_id, observed.version, SeatState::available())
            .await
        {
            Ok(version) => {
                let reclaimed = SeatRecord {
                    state: SeatState::available(),
                    version,
                    ..observed.clone()
                };
                debug!(
                    "Reclaimed expired {} hold on {}/{} (v{})",
                    observed.status(),
                    observed.event_id,
                    observed.seat_id,
                    version
                );
                self.notify(&reclaimed);
                ReclaimOutcome::Reclaimed { version }
            }
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                debug!(
                    "Seat {}/{} changed since it was scanned, not reclaiming",
                    observed.event_id, observed.seat_id
                );
                ReclaimOutcome::Skipped
            }
            Err(e) => ReclaimOutcome::Failed(e),
        }
    }

    pub async fn provision(&self, event_id: &EventId, seats: &[NewSeat]) -> StoreResult<usize> {
        self.store.provision(event_id, seats).await
    }

    async fn apply<F>(&self, op: Operation, event_id: &EventId, seat_id: &SeatId, decide: F) -> SeatOutcome
    where
        F: Fn(&SeatRecord, DateTime<Utc>) -> Decision,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_seen: Option<(SeatRecord, DateTime<Utc>)> = None;

        for attempt in 1..=attempts {
            let record = match self.store.get(event_id, seat_id).await {
                Ok(record) => record,
                Err(StoreError::NotFound { .. }) => return SeatOutcome::bare(seat_id, OutcomeCode::NotFound),
                Err(e) => return self.store_failure(op, event_id, seat_id, e),
            };
            let now = self.clock.now();

            let next = match decide(&record, now) {
                Decision::Done(outcome) => {
                    debug!("{} on {}/{}: {}", op, event_id, seat_id, outcome.code);
                    return outcome;
                }
                Decision::Write(next) => next,
            };

            match self
                .store
                .compare_and_set(event_id, seat_id, record.version, next.clone())
                .await
            {
                Ok(version) => {
                    let updated = SeatRecord {
                        state: next,
                        version,
                        ..record
                    };
                    debug!(
                        "{} on {}/{}: now {} (v{})",
                        op,
                        event_id,
                        seat_id,
                        updated.status(),
                        version
                    );
                    self.notify(&updated);
                    return SeatOutcome::describing(&updated, OutcomeCode::Ok, now);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!("{} on {}/{} lost a race (attempt {}/{})", op, event_id, seat_id, attempt, attempts);
                    last_seen = Some((record, now));
                    if attempt < attempts {
                        self.backoff(attempt).await;
                    }
                }
                Err(StoreError::NotFound { .. }) => return SeatOutcome::bare(seat_id, OutcomeCode::NotFound),
                Err(e) => return self.store_failure(op, event_id, seat_id, e),
            }
        }

        warn!(
            "{} on {}/{} gave up after {} contended attempts",
            op, event_id, seat_id, attempts
        );
        match last_seen {
            Some((record, now)) => SeatOutcome::describing(&record, OutcomeCode::Conflict, now),
            None => SeatOutcome::bare(seat_id, OutcomeCode::Conflict),
        }
    }

    fn notify(&self, record: &SeatRecord) {
        let change = SeatChange::from_record(record);
        let delivered = self.broadcaster.publish(&record.event_id, &change);
        debug!(
            "Published {}/{} {} v{} to {} subscriber(s)",
            record.event_id, record.seat_id, change.status, change.version, delivered
        );
    }

    fn store_failure(&self, op: Operation, event_id: &EventId, seat_id: &SeatId, e: StoreError) -> SeatOutcome {
        error!("{} on {}/{} failed: {}", op, event_id, seat_id, e);
        SeatOutcome::bare(seat_id, OutcomeCode::StoreUnavailable)
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.policy.retry_backoff.as_millis() as u64;
        if base == 0 {
            return;
        }
        let jitter = rand::thread_rng().gen_range(0..=base);
        let delay = base * u64::from(attempt) + jitter;
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }
}

/// Deadlines are kept to the millisecond, the coarsest precision any backend
/// stores, so outcomes, notifications and later reads agree.
fn hold_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    (now + ttl).trunc_subsecs(3)
}

/// Shared guard of extend/lock/confirm: the seat must be a live hold of
/// `holder`. `when_unheld` is the code for an AVAILABLE seat.
fn check_live_hold(
    record: &SeatRecord,
    holder: &HolderToken,
    now: DateTime<Utc>,
    when_unheld: OutcomeCode,
) -> Result<(), SeatOutcome> {
    match record.status() {
        SeatStatus::Sold => Err(SeatOutcome::describing(record, OutcomeCode::InvalidState, now)),
        SeatStatus::Available => Err(SeatOutcome::describing(record, when_unheld, now)),
        SeatStatus::Reserved | SeatStatus::Locked => {
            if record.is_expired_hold(now) {
                // The hold is gone whoever owned it.
                Err(SeatOutcome::describing(record, OutcomeCode::NotFound, now))
            } else if !record.is_held_by(holder) {
                Err(SeatOutcome::describing(record, OutcomeCode::Forbidden, now))
            } else {
                Ok(())
            }
        }
    }
}

fn dedupe(seat_ids: &[SeatId]) -> Vec<&SeatId> {
    let mut seen = HashSet::with_capacity(seat_ids.len());
    seat_ids.iter().filter(|id| seen.insert(*id)).collect()
}
