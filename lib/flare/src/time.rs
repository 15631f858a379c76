use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock predates the unix epoch")
}

/// Seconds since 1970-01-01. Certificate validity windows and challenge
/// freshness are measured on this clock.
#[inline]
pub fn timestamp_secs() -> u64 {
    since_epoch().as_secs()
}

/// Microseconds since 1970-01-01. All protocol timers run on this clock.
#[inline]
pub fn timestamp_usecs() -> u64 {
    since_epoch().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usecs_track_secs() {
        let secs = timestamp_secs();
        let usecs = timestamp_usecs();

        let diff = (usecs / 1_000_000) as i64 - secs as i64;
        assert!(diff.abs() <= 1);
    }

    #[test]
    fn test_clocks_are_monotonic_enough() {
        let first = timestamp_usecs();
        let second = timestamp_usecs();
        assert!(second >= first);
    }
}
