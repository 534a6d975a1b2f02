use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::repository::ExpiredScan;
use crate::reservation::{ReclaimOutcome, ReservationManager};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub reclaimed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// The scan itself failed part way; the next sweep starts over.
    pub interrupted: bool,
}

/// Background sweeper that returns lapsed holds to AVAILABLE so the seat map
/// and its subscribers catch up with the clock.
pub struct ExpiryReclaimer {
    manager: Arc<ReservationManager>,
    batch_size: usize,
}

impl ExpiryReclaimer {
    pub fn new(manager: Arc<ReservationManager>, batch_size: usize) -> Self {
        Self {
            manager,
            batch_size: batch_size.max(1),
        }
    }

    /// Walk every hold that was expired at the start of the sweep. One bad
    /// seat never stops the rest of the batch.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.manager.clock().now();
        let mut scan = ExpiredScan::new(self.manager.store().clone(), now, self.batch_size);
        let mut report = SweepReport::default();

        loop {
            let batch = match scan.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    error!("Expired-hold scan failed after {} records: {}", report.scanned, e);
                    report.interrupted = true;
                    break;
                }
            };

            for record in batch {
                report.scanned += 1;
                match self.manager.reclaim(&record).await {
                    ReclaimOutcome::Reclaimed { .. } => report.reclaimed += 1,
                    ReclaimOutcome::Skipped => report.skipped += 1,
                    ReclaimOutcome::Failed(e) => {
                        warn!("Could not reclaim {}/{}: {}", record.event_id, record.seat_id, e);
                        report.failed += 1;
                    }
                }
            }
        }

        if report.scanned > 0 {
            info!(
                "Sweep done: scanned={} reclaimed={} skipped={} failed={}",
                report.scanned, report.reclaimed, report.skipped, report.failed
            );
        }
        report
    }

    /// Sweep every `interval` until `shutdown` flips to true (or its sender
    /// goes away). A sweep in progress is finished before returning.
    pub async fn run<F>(&self, interval: Duration, mut shutdown: watch::Receiver<bool>, mut on_sweep: F)
    where
        F: FnMut(&SweepReport) + Send,
    {
        info!("Expiry reclaimer started (every {:?}, batch {})", interval, self.batch_size);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    debug!("Reclaimer tick: {:?}", report);
                    on_sweep(&report);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Expiry reclaimer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Delivery, EventBroadcaster};
    use crate::clock::{Clock, ManualClock};
    use crate::memory::InMemorySeatStore;
    use crate::repository::{ExpiredPage, NewSeat, ScanCursor, SeatInventoryStore, StoreError, StoreResult};
    use crate::reservation::{OutcomeCode, ReservationPolicy};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use seatmap_shared::{EventId, HolderToken, SeatId, SeatRecord, SeatState, SeatStatus};
    use std::collections::HashSet;

    /// Delegates to the in-memory store but refuses writes to some seats.
    struct FlakyStore {
        inner: InMemorySeatStore,
        broken: HashSet<SeatId>,
    }

    #[async_trait]
    impl SeatInventoryStore for FlakyStore {
        async fn get(&self, event_id: &EventId, seat_id: &SeatId) -> StoreResult<SeatRecord> {
            self.inner.get(event_id, seat_id).await
        }

        async fn compare_and_set(
            &self,
            event_id: &EventId,
            seat_id: &SeatId,
            expected_version: u64,
            next: SeatState,
        ) -> StoreResult<u64> {
            if self.broken.contains(seat_id) && next.status() == SeatStatus::Available {
                return Err(StoreError::Unavailable("disk on fire".into()));
            }
            self.inner.compare_and_set(event_id, seat_id, expected_version, next).await
        }

        async fn scan_expired_page(
            &self,
            now: DateTime<Utc>,
            cursor: Option<&ScanCursor>,
            limit: usize,
        ) -> StoreResult<ExpiredPage> {
            self.inner.scan_expired_page(now, cursor, limit).await
        }

        async fn list(&self, event_id: &EventId) -> StoreResult<Vec<SeatRecord>> {
            self.inner.list(event_id).await
        }

        async fn provision(&self, event_id: &EventId, seats: &[NewSeat]) -> StoreResult<usize> {
            self.inner.provision(event_id, seats).await
        }
    }

    struct Setup {
        manager: Arc<ReservationManager>,
        broadcaster: Arc<EventBroadcaster>,
        clock: Arc<ManualClock>,
        event: EventId,
    }

    async fn setup(store: Arc<dyn SeatInventoryStore>, seat_ids: &[&str]) -> Setup {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let event = EventId::new("evt-1");
        let new_seats: Vec<NewSeat> = seat_ids
            .iter()
            .map(|id| NewSeat { seat_id: SeatId::new(*id), section: None })
            .collect();
        store.provision(&event, &new_seats).await.unwrap();
        let manager = Arc::new(ReservationManager::new(
            store,
            broadcaster.clone(),
            clock.clone(),
            ReservationPolicy::default(),
        ));
        Setup { manager, broadcaster, clock, event }
    }

    fn ids(raw: &[&str]) -> Vec<SeatId> {
        raw.iter().map(|id| SeatId::new(*id)).collect()
    }

    #[tokio::test]
    async fn test_expired_hold_is_reclaimed_and_announced_once() {
        let s = setup(Arc::new(InMemorySeatStore::new()), &["B7"]).await;
        let z = HolderToken::new("holder-z");
        s.manager.reserve(&s.event, &ids(&["B7"]), &z, chrono::Duration::seconds(30)).await;

        let mut sub = s.broadcaster.subscribe(s.event.clone());
        s.clock.advance(chrono::Duration::seconds(31));

        let reclaimer = ExpiryReclaimer::new(s.manager.clone(), 10);
        let report = reclaimer.sweep().await;
        assert_eq!(report.reclaimed, 1);

        let record = s.manager.store().get(&s.event, &SeatId::new("B7")).await.unwrap();
        assert_eq!(record.status(), SeatStatus::Available);
        assert!(record.holder_token().is_none());

        match sub.try_recv() {
            Some(Delivery::Change(change)) => {
                assert_eq!(change.status, SeatStatus::Available);
                assert_eq!(change.version, 2);
            }
            other => panic!("expected one AVAILABLE change, got {:?}", other),
        }
        assert!(sub.try_recv().is_none());

        // Nothing left to do on the next pass.
        assert_eq!(reclaimer.sweep().await, SweepReport::default());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_live_holds_are_left_alone() {
        let s = setup(Arc::new(InMemorySeatStore::new()), &["A1", "A2"]).await;
        let x = HolderToken::new("x");
        s.manager.reserve(&s.event, &ids(&["A1"]), &x, chrono::Duration::seconds(30)).await;
        s.manager.reserve(&s.event, &ids(&["A2"]), &x, chrono::Duration::seconds(300)).await;
        s.clock.advance(chrono::Duration::seconds(60));

        let report = ExpiryReclaimer::new(s.manager.clone(), 10).sweep().await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.reclaimed, 1);

        let a2 = s.manager.store().get(&s.event, &SeatId::new("A2")).await.unwrap();
        assert!(a2.is_held_by(&x));
    }

    #[tokio::test]
    async fn test_stale_observation_is_skipped() {
        let s = setup(Arc::new(InMemorySeatStore::new()), &["A1"]).await;
        s.manager
            .reserve(&s.event, &ids(&["A1"]), &HolderToken::new("x"), chrono::Duration::seconds(10))
            .await;
        s.clock.advance(chrono::Duration::seconds(20));
        let observed = s.manager.store().get(&s.event, &SeatId::new("A1")).await.unwrap();

        // Someone else grabs the lapsed seat before the reclaimer gets to it.
        let y = HolderToken::new("y");
        let grabbed = s.manager.reserve(&s.event, &ids(&["A1"]), &y, chrono::Duration::seconds(60)).await;
        assert_eq!(grabbed[0].code, OutcomeCode::Ok);

        assert_eq!(s.manager.reclaim(&observed).await, ReclaimOutcome::Skipped);
        let record = s.manager.store().get(&s.event, &SeatId::new("A1")).await.unwrap();
        assert!(record.is_held_by(&y));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_batch() {
        let store = Arc::new(FlakyStore {
            inner: InMemorySeatStore::new(),
            broken: ids(&["A2"]).into_iter().collect(),
        });
        let s = setup(store, &["A1", "A2", "A3"]).await;
        s.manager
            .reserve(&s.event, &ids(&["A1", "A2", "A3"]), &HolderToken::new("x"), chrono::Duration::seconds(5))
            .await;
        s.clock.advance(chrono::Duration::seconds(5));

        let report = ExpiryReclaimer::new(s.manager.clone(), 2).sweep().await;
        assert_eq!(
            report,
            SweepReport { scanned: 3, reclaimed: 2, skipped: 0, failed: 1, interrupted: false }
        );

        let a3 = s.manager.store().get(&s.event, &SeatId::new("A3")).await.unwrap();
        assert_eq!(a3.status(), SeatStatus::Available);
        let a2 = s.manager.store().get(&s.event, &SeatId::new("A2")).await.unwrap();
        assert_eq!(a2.status(), SeatStatus::Reserved);
        assert_eq!(a2.effective_status(s.clock.now()), SeatStatus::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let s = setup(Arc::new(InMemorySeatStore::new()), &["A1"]).await;
        let reclaimer = Arc::new(ExpiryReclaimer::new(s.manager.clone(), 10));
        let (tx, rx) = watch::channel(false);

        let sweeps = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let task = {
            let reclaimer = reclaimer.clone();
            let sweeps = sweeps.clone();
            tokio::spawn(async move {
                reclaimer
                    .run(Duration::from_secs(10), rx, move |_| {
                        sweeps.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    })
                    .await
            })
        };

        // Ticks at 0s, 10s and 20s.
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reclaimer did not stop")
            .unwrap();
        assert_eq!(sweeps.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
