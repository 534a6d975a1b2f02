use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::pii::HolderToken;

/// Identifier of an event whose seat map is being sold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

/// Identifier of a seat, unique within its event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeatId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Non-blank and free of control characters. Stores use control
            /// characters as separators in their composite keys.
            pub fn is_well_formed(&self) -> bool {
                !self.0.trim().is_empty() && !self.0.chars().any(char::is_control)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(EventId);
string_id!(SeatId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    /// Soft hold, e.g. the seat sits in a cart.
    Reserved,
    /// Hold during active checkout (payment in progress).
    Locked,
    Sold,
}

impl SeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "AVAILABLE",
            SeatStatus::Reserved => "RESERVED",
            SeatStatus::Locked => "LOCKED",
            SeatStatus::Sold => "SOLD",
        }
    }

    /// RESERVED and LOCKED are the time-bounded statuses.
    pub fn is_hold(&self) -> bool {
        matches!(self, SeatStatus::Reserved | SeatStatus::Locked)
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown seat status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for SeatStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(SeatStatus::Available),
            "RESERVED" => Ok(SeatStatus::Reserved),
            "LOCKED" => Ok(SeatStatus::Locked),
            "SOLD" => Ok(SeatStatus::Sold),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// The mutable part of a seat, as written by a conditional update.
///
/// Fields are private so the only way to build one is through the
/// constructors below: `expires_at` exists exactly for RESERVED/LOCKED and a
/// holder exists for every status except AVAILABLE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatState {
    status: SeatStatus,
    holder_token: Option<HolderToken>,
    expires_at: Option<DateTime<Utc>>,
}

impl SeatState {
    pub fn available() -> Self {
        Self {
            status: SeatStatus::Available,
            holder_token: None,
            expires_at: None,
        }
    }

    pub fn reserved(holder: HolderToken, expires_at: DateTime<Utc>) -> Self {
        Self {
            status: SeatStatus::Reserved,
            holder_token: Some(holder),
            expires_at: Some(expires_at),
        }
    }

    pub fn locked(holder: HolderToken, expires_at: DateTime<Utc>) -> Self {
        Self {
            status: SeatStatus::Locked,
            holder_token: Some(holder),
            expires_at: Some(expires_at),
        }
    }

    pub fn sold(holder: HolderToken) -> Self {
        Self {
            status: SeatStatus::Sold,
            holder_token: Some(holder),
            expires_at: None,
        }
    }

    /// Rebuild a state read back from storage, rejecting rows that break the
    /// status/holder/expiry invariant.
    pub fn from_parts(
        status: SeatStatus,
        holder_token: Option<HolderToken>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        match (status, holder_token, expires_at) {
            (SeatStatus::Available, None, None) => Some(Self::available()),
            (SeatStatus::Reserved, Some(h), Some(e)) => Some(Self::reserved(h, e)),
            (SeatStatus::Locked, Some(h), Some(e)) => Some(Self::locked(h, e)),
            (SeatStatus::Sold, Some(h), None) => Some(Self::sold(h)),
            _ => None,
        }
    }

    pub fn status(&self) -> SeatStatus {
        self.status
    }

    pub fn holder_token(&self) -> Option<&HolderToken> {
        self.holder_token.as_ref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

/// One seat of one event. `(event_id, seat_id)` is immutable and unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatRecord {
    pub event_id: EventId,
    pub seat_id: SeatId,
    pub section: Option<String>,
    pub state: SeatState,
    pub version: u64,
}

impl SeatRecord {
    /// A freshly provisioned seat.
    pub fn provisioned(event_id: EventId, seat_id: SeatId, section: Option<String>) -> Self {
        Self {
            event_id,
            seat_id,
            section,
            state: SeatState::available(),
            version: 0,
        }
    }

    pub fn status(&self) -> SeatStatus {
        self.state.status()
    }

    pub fn holder_token(&self) -> Option<&HolderToken> {
        self.state.holder_token()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state.expires_at()
    }

    /// A hold whose deadline has passed. `expires_at == now` counts as expired.
    pub fn is_expired_hold(&self, now: DateTime<Utc>) -> bool {
        self.status().is_hold() && self.expires_at().is_some_and(|at| at <= now)
    }

    pub fn is_live_hold(&self, now: DateTime<Utc>) -> bool {
        self.status().is_hold() && !self.is_expired_hold(now)
    }

    pub fn is_held_by(&self, holder: &HolderToken) -> bool {
        self.holder_token() == Some(holder)
    }

    /// Status as buyers should see it: an expired hold is simply available,
    /// whether or not the reclaimer has swept it yet.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SeatStatus {
        if self.is_expired_hold(now) {
            SeatStatus::Available
        } else {
            self.status()
        }
    }
}
