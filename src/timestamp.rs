use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::SystemTime;

/// A Unix timestamp represented as seconds since the epoch.
///
/// Used for ledger row bookkeeping (`createdAt`, `confirmedAt`, `expiresAt`)
/// and for the age cutoffs applied by the reconciliation jobs. Serialized as
/// a plain integer in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Current wall-clock time. The ledger never runs on a pre-1970 clock.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("SystemTime before UNIX epoch?!?")
            .as_secs();
        Self(now)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// The timestamp `secs` seconds in the past, clamped at the epoch.
    pub fn saturating_sub(&self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }

    pub fn is_before(&self, other: UnixTimestamp) -> bool {
        self.0 < other.0
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_ordering() {
        let t = UnixTimestamp::from_secs(1_700_000_000);
        assert!(t.is_before(t + 180));
        assert_eq!((t + 180).as_secs(), 1_700_000_180);
    }

    #[test]
    fn test_saturating_sub_clamps_at_epoch() {
        let t = UnixTimestamp::from_secs(10);
        assert_eq!(t.saturating_sub(100).as_secs(), 0);
    }

    #[test]
    fn test_serializes_as_integer() {
        let t = UnixTimestamp::from_secs(1_700_000_000);
        assert_eq!(serde_json::to_string(&t).unwrap(), "1700000000");
    }
}
