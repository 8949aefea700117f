//! Wall-clock time helpers.
//!
//! Event timestamps on the feed (`TradeTime`) are milliseconds since the Unix
//! epoch, so subscription start times are recorded in the same unit.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_epoch_millis() {
        let ms = now_ms();
        // 2020-01-01T00:00:00Z in milliseconds.
        assert!(ms > 1_577_836_800_000);
    }
}
