//! Per-user behavioral profile data structures.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{BehaviorEvent, EventType};

/// Learned behavioral profile for a single user.
///
/// Counters are `f64` so exponential decay applies uniformly. Invariant:
/// the sum of `action_counts` equals `sample_count` (both are incremented
/// together and decayed by the same factor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    /// When this user was first observed.
    pub first_seen: DateTime<Utc>,
    /// Event timestamp of the most recent fold-in.
    pub last_updated: DateTime<Utc>,
    /// Activity mass per UTC hour of day.
    pub hour_histogram: [f64; 24],
    /// Device fingerprints seen for this user, with last-seen times.
    /// Bounded; the stalest entry is evicted past the cap.
    pub known_devices: HashMap<String, DateTime<Utc>>,
    /// Source IPs seen for this user, with last-seen times. Bounded.
    pub known_ips: HashMap<String, DateTime<Utc>>,
    /// Activity mass per event kind.
    pub action_counts: HashMap<EventType, f64>,
    /// Total decayed observation mass.
    pub sample_count: f64,
}

impl UserProfile {
    pub fn new(user_id: String, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            first_seen: now,
            last_updated: now,
            hour_histogram: [0.0; 24],
            known_devices: HashMap::new(),
            known_ips: HashMap::new(),
            action_counts: HashMap::new(),
            sample_count: 0.0,
        }
    }

    /// Multiply every counter by `factor`, preserving the
    /// action-counts/sample-count invariant.
    pub fn decay(&mut self, factor: f64) {
        for h in self.hour_histogram.iter_mut() {
            *h *= factor;
        }
        for c in self.action_counts.values_mut() {
            *c *= factor;
        }
        self.sample_count *= factor;
    }

    /// Fold one event into the profile, evicting the stalest device/IP
    /// entries past the given caps.
    pub fn observe(&mut self, event: &BehaviorEvent, max_devices: usize, max_ips: usize) {
        self.hour_histogram[event.hour_of_day()] += 1.0;
        *self.action_counts.entry(event.event_type).or_insert(0.0) += 1.0;
        self.sample_count += 1.0;

        if let Some(fp) = &event.device_fingerprint {
            self.known_devices.insert(fp.clone(), event.timestamp);
            evict_stalest(&mut self.known_devices, max_devices);
        }
        self.known_ips
            .insert(event.ip_address.to_string(), event.timestamp);
        evict_stalest(&mut self.known_ips, max_ips);

        if event.timestamp > self.last_updated {
            self.last_updated = event.timestamp;
        }
    }

    /// Detect invariant violations (NaN or negative mass). Returns a
    /// description of the first violation found.
    pub fn corruption(&self) -> Option<String> {
        if !self.sample_count.is_finite() || self.sample_count < 0.0 {
            return Some(format!("sample_count = {}", self.sample_count));
        }
        for (i, h) in self.hour_histogram.iter().enumerate() {
            if !h.is_finite() || *h < 0.0 {
                return Some(format!("hour_histogram[{i}] = {h}"));
            }
        }
        for (kind, c) in &self.action_counts {
            if !c.is_finite() || *c < 0.0 {
                return Some(format!("action_counts[{}] = {c}", kind.as_str()));
            }
        }
        None
    }
}

fn evict_stalest(map: &mut HashMap<String, DateTime<Utc>>, cap: usize) {
    while map.len() > cap {
        let stalest = map
            .iter()
            .min_by_key(|(k, t)| (**t, (*k).clone()))
            .map(|(k, _)| k.clone());
        match stalest {
            Some(k) => {
                map.remove(&k);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn event_at(secs: i64, ip: &str, device: Option<&str>) -> BehaviorEvent {
        BehaviorEvent {
            event_id: Uuid::new_v4(),
            user_id: "u1".into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            event_type: EventType::Login,
            ip_address: ip.parse().unwrap(),
            device_fingerprint: device.map(String::from),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_observe_keeps_count_invariant() {
        let mut p = UserProfile::new("u1".into(), Utc.timestamp_opt(0, 0).unwrap());
        for i in 0..5 {
            p.observe(&event_at(i * 3600, "10.0.0.1", None), 4, 4);
        }
        let total: f64 = p.action_counts.values().sum();
        assert!((total - p.sample_count).abs() < 1e-9);
        assert_eq!(p.sample_count, 5.0);
    }

    #[test]
    fn test_decay_preserves_count_invariant() {
        let mut p = UserProfile::new("u1".into(), Utc.timestamp_opt(0, 0).unwrap());
        for i in 0..10 {
            p.observe(&event_at(i, "10.0.0.1", None), 4, 4);
        }
        p.decay(0.9);
        let total: f64 = p.action_counts.values().sum();
        assert!((total - p.sample_count).abs() < 1e-9);
        assert!((p.sample_count - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_known_ips_bounded_with_stalest_evicted() {
        let mut p = UserProfile::new("u1".into(), Utc.timestamp_opt(0, 0).unwrap());
        for i in 0..6 {
            p.observe(&event_at(i * 60, &format!("10.0.0.{i}"), None), 4, 3);
        }
        assert_eq!(p.known_ips.len(), 3);
        assert!(!p.known_ips.contains_key("10.0.0.0"));
        assert!(p.known_ips.contains_key("10.0.0.5"));
    }

    #[test]
    fn test_reseen_device_refreshes_last_seen() {
        let mut p = UserProfile::new("u1".into(), Utc.timestamp_opt(0, 0).unwrap());
        p.observe(&event_at(0, "10.0.0.1", Some("fp-a")), 2, 4);
        p.observe(&event_at(60, "10.0.0.1", Some("fp-b")), 2, 4);
        // fp-a is touched again, so fp-b is the stalest when fp-c lands.
        p.observe(&event_at(120, "10.0.0.1", Some("fp-a")), 2, 4);
        p.observe(&event_at(180, "10.0.0.1", Some("fp-c")), 2, 4);
        assert!(p.known_devices.contains_key("fp-a"));
        assert!(p.known_devices.contains_key("fp-c"));
        assert!(!p.known_devices.contains_key("fp-b"));
    }

    #[test]
    fn test_corruption_detects_nan() {
        let mut p = UserProfile::new("u1".into(), Utc.timestamp_opt(0, 0).unwrap());
        p.hour_histogram[3] = f64::NAN;
        assert!(p.corruption().is_some());
    }

    #[test]
    fn test_fresh_profile_not_corrupt() {
        let p = UserProfile::new("u1".into(), Utc.timestamp_opt(0, 0).unwrap());
        assert!(p.corruption().is_none());
    }
}
