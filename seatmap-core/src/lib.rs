pub mod availability;
pub mod broadcast;
pub mod clock;
pub mod memory;
pub mod reclaimer;
pub mod repository;
pub mod reservation;

pub use availability::{SeatMap, SeatView, SectionCounts};
pub use broadcast::{Delivery, EventBroadcaster, Subscription, SubscriptionHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::InMemorySeatStore;
pub use reclaimer::{ExpiryReclaimer, SweepReport};
pub use repository::{ExpiredPage, ExpiredScan, NewSeat, ScanCursor, SeatInventoryStore, StoreError, StoreResult};
pub use reservation::{OutcomeCode, ReclaimOutcome, ReservationManager, ReservationPolicy, SeatOutcome};
