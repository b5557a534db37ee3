//! Wall-clock time helpers.
//!
//! Request signing needs a millisecond Unix timestamp; everything that
//! measures elapsed time uses `tokio::time::Instant` instead so tests can run
//! on a paused clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current time as **seconds** since Unix epoch.
#[inline]
pub fn now_secs() -> u64 {
    now_ms() / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_and_seconds_agree() {
        let ms = now_ms();
        let s = now_secs();
        assert!(ms / 1_000 >= s.saturating_sub(1));
        assert!(ms > 1_600_000_000_000);
    }
}
