use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of whoever holds a seat (session id or order reference).
///
/// The raw value is needed to compare holders and to persist it, but it is a
/// bearer secret: `Debug` and `Display` only reveal a short prefix so that
/// `tracing::debug!("{:?}", record)` cannot leak a usable token.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(String);

const VISIBLE_PREFIX: usize = 4;

impl HolderToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    fn masked(&self) -> String {
        let prefix: String = self.0.chars().take(VISIBLE_PREFIX).collect();
        format!("{}********", prefix)
    }
}

impl fmt::Debug for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HolderToken({})", self.masked())
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl From<&str> for HolderToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for HolderToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}
