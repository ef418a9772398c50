use chrono::{DateTime, Datelike, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true while a cache entry loaded at `loaded_unix_ms` is still
/// inside its `ttl_ms` window at `now_unix_ms`.
pub fn is_fresh(loaded_unix_ms: u64, ttl_ms: u64, now_unix_ms: u64) -> bool {
    now_unix_ms.saturating_sub(loaded_unix_ms) < ttl_ms
}

/// UTC calendar-day bucket key (`YYYY-MM-DD`) for daily counters.
pub fn day_key(unix_ms: u64) -> String {
    let at = utc_from_unix_ms(unix_ms);
    format!("{:04}-{:02}-{:02}", at.year(), at.month(), at.day())
}

/// UTC calendar-month bucket key (`YYYY-MM`) for monthly counters.
pub fn month_key(unix_ms: u64) -> String {
    let at = utc_from_unix_ms(unix_ms);
    format!("{:04}-{:02}", at.year(), at.month())
}

fn utc_from_unix_ms(unix_ms: u64) -> DateTime<Utc> {
    let clamped = i64::try_from(unix_ms).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(clamped).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{day_key, is_fresh, month_key};

    #[test]
    fn freshness_window_is_half_open() {
        assert!(is_fresh(1_000, 500, 1_000));
        assert!(is_fresh(1_000, 500, 1_499));
        assert!(!is_fresh(1_000, 500, 1_500));
    }

    #[test]
    fn zero_ttl_entries_are_never_fresh() {
        assert!(!is_fresh(1_000, 0, 1_000));
    }

    #[test]
    fn bucket_keys_roll_at_utc_boundaries() {
        // 2026-01-31T23:59:59Z and one second later.
        let before = 1_769_903_999_000_u64;
        let after = before + 1_000;
        assert_eq!(day_key(before), "2026-01-31");
        assert_eq!(day_key(after), "2026-02-01");
        assert_eq!(month_key(before), "2026-01");
        assert_eq!(month_key(after), "2026-02");
    }
}
