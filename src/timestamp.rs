use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

/// An absolute wall-clock time in seconds since the unix epoch, the unit both
/// lock times and block timestamps are expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u32);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("current time is after the unix epoch");

        #[allow(clippy::cast_possible_truncation)]
        Timestamp(duration.as_secs() as u32)
    }

    pub fn plus(self, seconds: u32) -> Self {
        Timestamp(self.0.saturating_add(seconds))
    }

    pub fn minus(self, seconds: u32) -> Self {
        Timestamp(self.0.saturating_sub(seconds))
    }

    pub fn as_secs(self) -> u32 {
        self.0
    }
}

impl From<u32> for Timestamp {
    fn from(seconds: u32) -> Self {
        Timestamp(seconds)
    }
}

impl From<Timestamp> for u32 {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
