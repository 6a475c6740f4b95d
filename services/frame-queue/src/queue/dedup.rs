//! Time-bounded memory of recently admitted frame keys.

use crate::clock::EpochMillis;
use std::collections::HashMap;
use std::time::Duration;

/// Shortest allowed suppression window.
pub const MIN_RECENT_TTL: Duration = Duration::from_secs(1);
/// Longest allowed suppression window.
pub const MAX_RECENT_TTL: Duration = Duration::from_secs(60 * 60);
/// Window used when the caller does not pick one.
pub const DEFAULT_RECENT_TTL: Duration = Duration::from_secs(10 * 60);

/// Clamp a requested TTL in milliseconds, falling back to `default` when
/// nothing (or zero) was requested.
pub fn clamp_recent_ttl(requested_ms: Option<u64>, default: Duration) -> Duration {
    let ttl = match requested_ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => default,
    };
    ttl.clamp(MIN_RECENT_TTL, MAX_RECENT_TTL)
}

/// Set of dedup keys with their last-seen admission time.
#[derive(Debug, Default)]
pub struct DedupWindow {
    seen: HashMap<String, EpochMillis>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key last seen more than `ttl` before `now`.
    ///
    /// Runs at the start of each push batch so the window stays bounded
    /// regardless of how often agents call in.
    pub fn prune(&mut self, ttl: Duration, now: EpochMillis) -> usize {
        let ttl_ms = ttl.as_millis() as u64;
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| *seen_at != 0 && now.saturating_sub(*seen_at) <= ttl_ms);
        before - self.seen.len()
    }

    pub fn record_seen(&mut self, key: &str, now: EpochMillis) {
        self.seen.insert(key.to_string(), now);
    }

    pub fn is_recently_seen(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }

    /// Keys currently tracked.
    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_recent_ttl() {
        assert_eq!(clamp_recent_ttl(None, DEFAULT_RECENT_TTL), DEFAULT_RECENT_TTL);
        assert_eq!(clamp_recent_ttl(Some(0), DEFAULT_RECENT_TTL), DEFAULT_RECENT_TTL);
        assert_eq!(clamp_recent_ttl(Some(10), DEFAULT_RECENT_TTL), MIN_RECENT_TTL);
        assert_eq!(
            clamp_recent_ttl(Some(24 * 60 * 60 * 1000), DEFAULT_RECENT_TTL),
            MAX_RECENT_TTL
        );
        assert_eq!(
            clamp_recent_ttl(Some(5_000), DEFAULT_RECENT_TTL),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_prune_keeps_keys_inside_window() {
        let mut window = DedupWindow::new();
        window.record_seen("old", 1_000);
        window.record_seen("edge", 5_000);
        window.record_seen("fresh", 9_000);

        let dropped = window.prune(Duration::from_secs(5), 10_000);

        assert_eq!(dropped, 1);
        assert!(!window.is_recently_seen("old"));
        assert!(window.is_recently_seen("edge"));
        assert!(window.is_recently_seen("fresh"));
    }

    #[test]
    fn test_record_seen_refreshes_timestamp() {
        let mut window = DedupWindow::new();
        window.record_seen("k", 1_000);
        window.record_seen("k", 8_000);
        window.prune(Duration::from_secs(5), 10_000);
        assert!(window.is_recently_seen("k"));
        assert_eq!(window.len(), 1);
    }
}
