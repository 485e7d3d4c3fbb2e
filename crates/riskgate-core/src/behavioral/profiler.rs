//! Deviation scoring and profile maintenance.
//!
//! The profiler answers two questions for every event, always in this
//! order: how far does the event sit from the user's learned behavior
//! (`deviation`), and then fold the event into that behavior (`update`).
//! Scoring before updating keeps an event from vouching for itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ProfileConfig;
use crate::error::{Result, ScoreError};
use crate::event::BehaviorEvent;

use super::profile::UserProfile;

/// Per-signal deviation scores, each in \[0.0, 1.0\]. Higher is more
/// unusual for this user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationVector {
    /// Hour-of-day unfamiliarity (neighbor-smoothed histogram).
    pub hour: f64,
    /// 1.0 for an unseen device fingerprint, 0.0 for a known one or
    /// when no fingerprint was supplied.
    pub device: f64,
    /// 1.0 for an unseen source IP.
    pub ip: f64,
    /// One minus the relative frequency of this event kind.
    pub action_mix: f64,
    /// Set when the user had too little history to score against.
    pub cold_start: bool,
}

impl DeviationVector {
    /// The neutral vector used before a user has enough history.
    pub fn cold_start(neutral: f64) -> Self {
        Self {
            hour: neutral,
            device: neutral,
            ip: neutral,
            action_mix: neutral,
            cold_start: true,
        }
    }

    /// Signals in canonical feature order.
    pub fn as_features(&self) -> [f64; 4] {
        [self.hour, self.device, self.ip, self.action_mix]
    }
}

/// Owns a shard of user profiles. Not internally synchronized; each
/// pipeline worker holds exactly one. Tuning parameters are supplied
/// per call so configuration swaps take effect immediately.
#[derive(Default)]
pub struct BehaviorProfiler {
    profiles: HashMap<String, UserProfile>,
}

impl BehaviorProfiler {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }

    /// Score `event` against the user's profile without mutating it.
    ///
    /// A user with fewer than `min_samples` observations (or none at
    /// all) gets the configured neutral score on every signal with
    /// `cold_start` set. A corrupt profile is dropped and reported as
    /// [`ScoreError::StateCorruption`]; the next event for that user
    /// starts a fresh profile.
    pub fn deviation(
        &mut self,
        event: &BehaviorEvent,
        config: &ProfileConfig,
    ) -> Result<DeviationVector> {
        let profile = match self.profiles.get(&event.user_id) {
            Some(p) => p,
            None => return Ok(DeviationVector::cold_start(config.neutral_deviation)),
        };

        if let Some(detail) = profile.corruption() {
            warn!(user_id = %event.user_id, %detail, "dropping corrupt profile");
            self.profiles.remove(&event.user_id);
            return Err(ScoreError::StateCorruption {
                user_id: event.user_id.clone(),
                detail,
            });
        }

        if profile.sample_count < config.min_samples as f64 {
            return Ok(DeviationVector::cold_start(config.neutral_deviation));
        }

        let hour = hour_deviation(profile, event.hour_of_day());

        let device = match &event.device_fingerprint {
            Some(fp) if profile.known_devices.contains_key(fp) => 0.0,
            Some(_) => 1.0,
            None => 0.0,
        };

        let ip = if profile
            .known_ips
            .contains_key(&event.ip_address.to_string())
        {
            0.0
        } else {
            1.0
        };

        let freq = profile
            .action_counts
            .get(&event.event_type)
            .copied()
            .unwrap_or(0.0)
            / profile.sample_count;
        let action_mix = (1.0 - freq).clamp(0.0, 1.0);

        Ok(DeviationVector {
            hour,
            device,
            ip,
            action_mix,
            cold_start: false,
        })
    }

    /// Fold `event` into the user's profile, creating it on first
    /// sight. Applies exponential decay first when the profile has
    /// been idle past the refresh interval.
    pub fn update(&mut self, event: &BehaviorEvent, config: &ProfileConfig) {
        if !self.profiles.contains_key(&event.user_id) {
            self.evict_to_fit(config.max_profiles);
        }
        let profile = self
            .profiles
            .entry(event.user_id.clone())
            .or_insert_with(|| UserProfile::new(event.user_id.clone(), event.timestamp));

        let idle = event
            .timestamp
            .signed_duration_since(profile.last_updated)
            .num_seconds();
        if idle > config.decay_refresh_interval_secs as i64 {
            profile.decay(config.decay_factor);
        }

        profile.observe(event, config.max_known_devices, config.max_known_ips);
    }

    /// Evict least-recently-updated profiles until a new one fits.
    fn evict_to_fit(&mut self, max_profiles: usize) {
        while self.profiles.len() >= max_profiles {
            let stalest = self
                .profiles
                .values()
                .min_by_key(|p| (p.last_updated, p.user_id.clone()))
                .map(|p| p.user_id.clone());
            match stalest {
                Some(user_id) => {
                    warn!(%user_id, "evicting least-recently-updated profile");
                    self.profiles.remove(&user_id);
                }
                None => break,
            }
        }
    }

    pub fn profile(&self, user_id: &str) -> Option<&UserProfile> {
        self.profiles.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn profile_mut(&mut self, user_id: &str) -> Option<&mut UserProfile> {
        self.profiles.get_mut(user_id)
    }
}

/// How unfamiliar this hour of day is for the user, with mass in the
/// two neighboring hours counting at half weight.
fn hour_deviation(profile: &UserProfile, hour: usize) -> f64 {
    let h = &profile.hour_histogram;
    let prev = h[(hour + 23) % 24];
    let next = h[(hour + 1) % 24];
    let smoothed = 0.5 * prev + h[hour] + 0.5 * next;
    // A uniform user has sample_count / 24 mass per hour; treat double
    // that as fully familiar.
    let familiar = (smoothed / profile.sample_count * 12.0).clamp(0.0, 1.0);
    1.0 - familiar
}
