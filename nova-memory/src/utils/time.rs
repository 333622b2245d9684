//! Time Utilities
//!
//! Timestamps are persisted as unix milliseconds.

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Convert to unix milliseconds
pub fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert from unix milliseconds, clamping invalid values to the epoch
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_utc() {
        let now = now_utc();
        assert!(now.timestamp() > 0);
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = now_utc();
        let restored = from_millis(to_millis(now));
        assert_eq!(now.timestamp_millis(), restored.timestamp_millis());
    }

    #[test]
    fn test_from_millis_out_of_range() {
        assert_eq!(from_millis(i64::MAX), DateTime::<Utc>::default());
    }
}
