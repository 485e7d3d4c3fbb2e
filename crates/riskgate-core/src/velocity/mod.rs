//! Sliding-window event velocity tracking.
//!
//! Counts events per key (user or source IP) over fixed-width time
//! buckets, answering "how many events in the last N seconds" for each
//! configured window. Each bucket also tracks login activity and the
//! distinct sources seen, so a burst of logins or a fan-out across
//! addresses is visible as its own signal. Buckets are pruned lazily
//! relative to the most recent timestamp seen for that key, so keys
//! that go quiet cost nothing until touched again.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::VelocityConfig;
use crate::event::EventType;

/// Counts for one event across every configured window, in the same
/// order as [`VelocityConfig::windows_secs`]. The recorded event is
/// included in each count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCounts {
    /// Total events per window.
    pub counts: Vec<u32>,
    /// Login events per window.
    pub logins: Vec<u32>,
    /// Distinct source tags per window. For user-keyed state the source
    /// is the event's IP; for IP-keyed state it is the user id.
    pub distinct_sources: Vec<u32>,
    /// Set when the event's timestamp was ahead of the wall clock by
    /// more than the skew tolerance and was clamped to "now".
    pub clamped: bool,
}

#[derive(Default)]
struct Bucket {
    total: u32,
    logins: u32,
    sources: HashSet<String>,
}

struct KeyState {
    buckets: BTreeMap<i64, Bucket>,
    max_bucket: i64,
}

/// Per-key bucketed velocity state. Not internally synchronized; each
/// pipeline worker owns its own checker for user keys, and IP keys sit
/// behind a sharded mutex table.
pub struct VelocityChecker {
    bucket_width: i64,
    /// Window sizes in buckets, ascending.
    window_buckets: Vec<i64>,
    retention_buckets: i64,
    skew_tolerance: i64,
    state: HashMap<String, KeyState>,
}

impl VelocityChecker {
    pub fn new(config: &VelocityConfig) -> Self {
        let bucket_width = config.bucket_width_secs.max(1) as i64;
        let window_buckets: Vec<i64> = config
            .windows_secs
            .iter()
            .map(|w| ((*w as i64) / bucket_width).max(1))
            .collect();
        let retention_buckets = window_buckets.iter().copied().max().unwrap_or(1);
        VelocityChecker {
            bucket_width,
            window_buckets,
            retention_buckets,
            skew_tolerance: config.clock_skew_tolerance_secs as i64,
            state: HashMap::new(),
        }
    }

    /// Record one event for `key` and return the per-window counts at
    /// that event's position. `source` tags the other side of the event
    /// for the distinct-source count. Timestamps ahead of `now` by more
    /// than the skew tolerance are clamped to `now`; stale timestamps
    /// are accepted as-is.
    pub fn record_and_count(
        &mut self,
        key: &str,
        event_type: EventType,
        source: &str,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> WindowCounts {
        let mut secs = timestamp.timestamp();
        let now_secs = now.timestamp();
        let clamped = secs > now_secs + self.skew_tolerance;
        if clamped {
            secs = now_secs;
        }
        let bucket = secs.div_euclid(self.bucket_width);

        let entry = self.state.entry(key.to_string()).or_insert_with(|| KeyState {
            buckets: BTreeMap::new(),
            max_bucket: bucket,
        });
        entry.max_bucket = entry.max_bucket.max(bucket);

        // Lazy prune keyed to the newest bucket seen for this key.
        let cutoff = entry.max_bucket - self.retention_buckets + 1;
        entry.buckets = entry.buckets.split_off(&cutoff);

        let slot = entry.buckets.entry(bucket).or_default();
        slot.total += 1;
        if event_type == EventType::Login {
            slot.logins += 1;
        }
        if !slot.sources.contains(source) {
            slot.sources.insert(source.to_string());
        }

        // Windows are right-aligned at the event's own bucket: a window
        // of n buckets covers (bucket - n, bucket].
        let mut counts = Vec::with_capacity(self.window_buckets.len());
        let mut logins = Vec::with_capacity(self.window_buckets.len());
        let mut distinct_sources = Vec::with_capacity(self.window_buckets.len());
        for n in &self.window_buckets {
            let mut total = 0;
            let mut login_total = 0;
            let mut seen: HashSet<&str> = HashSet::new();
            for (_, b) in entry.buckets.range((bucket - n + 1)..=bucket) {
                total += b.total;
                login_total += b.logins;
                seen.extend(b.sources.iter().map(String::as_str));
            }
            counts.push(total);
            logins.push(login_total);
            distinct_sources.push(seen.len() as u32);
        }

        WindowCounts {
            counts,
            logins,
            distinct_sources,
            clamped,
        }
    }

    /// Drop every key whose newest activity is past retention.
    pub fn prune_idle(&mut self, now: DateTime<Utc>) {
        let cutoff = now.timestamp().div_euclid(self.bucket_width) - self.retention_buckets;
        self.state.retain(|_, s| s.max_bucket > cutoff);
    }

    /// Discard all state for one key.
    pub fn reset(&mut self, key: &str) {
        self.state.remove(key);
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.state.len()
    }
}
