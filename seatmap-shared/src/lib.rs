pub mod models;
pub mod pii;

pub use models::events::{SeatChange, SeatUpdateMessage};
pub use models::seat::{EventId, SeatId, SeatRecord, SeatState, SeatStatus, UnknownStatus};
pub use pii::HolderToken;
