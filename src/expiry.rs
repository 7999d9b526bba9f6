use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{ClientError, Result};

/// The expiry of a stored value, as sent on the wire.
///
/// Callers may express an expiry either as an absolute point in time (`SystemTime`, converted
/// to epoch seconds) or as a number of seconds (`u64`, `Duration` or a numeric string), which the
/// server interprets as relative or absolute depending on its magnitude. Both forms are
/// normalized into this type before any request is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expiry(u64);

impl Expiry {
    /// the value never expires
    pub const NEVER: Expiry = Expiry(0);

    /// an expiry given as a number of seconds
    pub fn seconds(secs: u64) -> Self {
        Expiry(secs)
    }

    /// an expiry at an absolute point in time, in whole epoch seconds
    /// # Errors
    /// returns [`ClientError::Argument`] if `time` is before the epoch
    pub fn at(time: SystemTime) -> Result<Self> {
        time.duration_since(UNIX_EPOCH)
            .map(|d| Expiry(d.as_secs()))
            .map_err(|e| {
                ClientError::Argument(format!("expiry {:?} before the epoch", e.duration()))
            })
    }

    /// the wire value
    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Expiry {
    fn from(secs: u64) -> Self {
        Expiry::seconds(secs)
    }
}

impl From<Duration> for Expiry {
    fn from(d: Duration) -> Self {
        Expiry::seconds(d.as_secs())
    }
}

impl TryFrom<SystemTime> for Expiry {
    type Error = ClientError;

    fn try_from(time: SystemTime) -> Result<Self> {
        Expiry::at(time)
    }
}

impl FromStr for Expiry {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Expiry)
            .map_err(|_| ClientError::Argument(format!("invalid expiry {:?}", s)))
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_time_becomes_epoch_seconds() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_999);
        assert_eq!(Expiry::at(t).unwrap().as_secs(), 1_700_000_000);
        assert_eq!(Expiry::try_from(UNIX_EPOCH).unwrap(), Expiry::NEVER);
    }

    #[test]
    fn time_before_the_epoch_is_rejected() {
        let t = UNIX_EPOCH - Duration::from_secs(3600);
        match Expiry::at(t) {
            Err(ClientError::Argument(msg)) => assert!(msg.contains("before the epoch"), "{}", msg),
            other => panic!("expected an argument error, got {:?}", other),
        }
        assert!(Expiry::try_from(t).is_err());
    }

    #[test]
    fn numeric_forms_pass_through() {
        assert_eq!(Expiry::from(60u64).to_string(), "60");
        assert_eq!(Expiry::from(Duration::from_secs(90)).as_secs(), 90);
        assert_eq!(" 120 ".parse::<Expiry>().unwrap().as_secs(), 120);
        assert!("-5".parse::<Expiry>().is_err());
        assert!("soon".parse::<Expiry>().is_err());
    }
}
