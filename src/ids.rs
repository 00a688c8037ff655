use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Per-connection identifier used to correlate log lines across the accept
/// loop, the worker and the request pipeline.
///
/// Backed by a ULID so ids sort by accept time.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(pub ulid::Ulid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ConnectionId(ulid::Ulid::from_string(s)?))
    }
}
