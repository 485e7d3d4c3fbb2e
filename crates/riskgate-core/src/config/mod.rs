//! Engine configuration: TOML loading, validation, and hot swap.

use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ScoreError};
use crate::risk::{Decision, DecisionPolicy, RiskTier, TierThresholds};

/// Top-level engine configuration, loaded from a TOML file. Every
/// field has a default; a missing file yields the default config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub velocity: VelocityConfig,

    #[serde(default)]
    pub profile: ProfileConfig,

    /// Raw-score cut points for tier calibration.
    #[serde(default)]
    pub thresholds: TierThresholds,

    /// Action taken per tier.
    #[serde(default)]
    pub policy: DecisionPolicy,

    #[serde(default)]
    pub audit: AuditConfig,

    /// Latency budget for one model scoring call.
    #[serde(default = "default_scoring_timeout_ms")]
    pub scoring_timeout_ms: u64,

    /// Decision applied when an event cannot be scored.
    #[serde(default = "default_fallback_decision")]
    pub fallback_decision: Decision,

    /// Assessments at or above this tier go to the alert channel.
    #[serde(default = "default_alert_min_tier")]
    pub alert_min_tier: RiskTier,

    /// Pipeline worker count; users are sharded across workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Velocity window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityConfig {
    /// Width of one counting bucket.
    #[serde(default = "default_bucket_width")]
    pub bucket_width_secs: u64,
    /// Window sizes, ascending; each must be a multiple of the bucket
    /// width. The largest window sets retention.
    #[serde(default = "default_windows")]
    pub windows_secs: Vec<u64>,
    /// How far ahead of the wall clock a timestamp may sit before it
    /// is clamped.
    #[serde(default = "default_skew_tolerance")]
    pub clock_skew_tolerance_secs: u64,
}

/// Behavior profile configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Observations required before deviation scoring engages.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    /// Deviation reported on every signal during cold start.
    #[serde(default = "default_neutral_deviation")]
    pub neutral_deviation: f64,
    /// Multiplier applied to profile counters after an idle period.
    /// Must be in (0, 1).
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    /// Idle seconds before decay applies on the next update.
    #[serde(default = "default_decay_refresh")]
    pub decay_refresh_interval_secs: u64,
    #[serde(default = "default_max_devices")]
    pub max_known_devices: usize,
    #[serde(default = "default_max_ips")]
    pub max_known_ips: usize,
    /// Profiles kept across all users before least-recently-updated
    /// eviction. Split evenly across workers.
    #[serde(default = "default_max_profiles")]
    pub max_profiles: usize,
}

/// Audit log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Rotate the JSONL file past this size.
    #[serde(default = "default_audit_max_bytes")]
    pub max_file_bytes: u64,
    /// Rotated files kept before the oldest is deleted.
    #[serde(default = "default_audit_max_files")]
    pub max_rotated_files: usize,
    /// Records buffered toward the writer thread before drops.
    #[serde(default = "default_audit_queue")]
    pub queue_capacity: usize,
}

fn default_scoring_timeout_ms() -> u64 {
    250
}

fn default_fallback_decision() -> Decision {
    Decision::Flag
}

fn default_alert_min_tier() -> RiskTier {
    RiskTier::High
}

fn default_workers() -> usize {
    4
}

fn default_bucket_width() -> u64 {
    60
}

fn default_windows() -> Vec<u64> {
    vec![60, 300, 3600]
}

fn default_skew_tolerance() -> u64 {
    30
}

fn default_min_samples() -> u64 {
    10
}

fn default_neutral_deviation() -> f64 {
    0.3
}

fn default_decay_factor() -> f64 {
    0.95
}

fn default_decay_refresh() -> u64 {
    86_400
}

fn default_max_devices() -> usize {
    10
}

fn default_max_ips() -> usize {
    20
}

fn default_max_profiles() -> usize {
    100_000
}

fn default_audit_max_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_audit_max_files() -> usize {
    5
}

fn default_audit_queue() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            velocity: VelocityConfig::default(),
            profile: ProfileConfig::default(),
            thresholds: TierThresholds::default(),
            policy: DecisionPolicy::default(),
            audit: AuditConfig::default(),
            scoring_timeout_ms: default_scoring_timeout_ms(),
            fallback_decision: default_fallback_decision(),
            alert_min_tier: default_alert_min_tier(),
            workers: default_workers(),
        }
    }
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            bucket_width_secs: default_bucket_width(),
            windows_secs: default_windows(),
            clock_skew_tolerance_secs: default_skew_tolerance(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            neutral_deviation: default_neutral_deviation(),
            decay_factor: default_decay_factor(),
            decay_refresh_interval_secs: default_decay_refresh(),
            max_known_devices: default_max_devices(),
            max_known_ips: default_max_ips(),
            max_profiles: default_max_profiles(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_audit_max_bytes(),
            max_rotated_files: default_audit_max_files(),
            queue_capacity: default_audit_queue(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults
    /// when the file does not exist. The result is always validated.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)
                .map_err(|e| ScoreError::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;

        let v = &self.velocity;
        if v.bucket_width_secs == 0 {
            return Err(ScoreError::Config("bucket_width_secs must be nonzero".into()));
        }
        if v.windows_secs.is_empty() {
            return Err(ScoreError::Config("at least one velocity window is required".into()));
        }
        if !v.windows_secs.windows(2).all(|w| w[0] < w[1]) {
            return Err(ScoreError::Config(
                "velocity windows must be strictly ascending".into(),
            ));
        }
        for w in &v.windows_secs {
            if *w == 0 || w % v.bucket_width_secs != 0 {
                return Err(ScoreError::Config(format!(
                    "velocity window {w}s is not a nonzero multiple of the {}s bucket width",
                    v.bucket_width_secs
                )));
            }
        }

        let p = &self.profile;
        if !(p.decay_factor > 0.0 && p.decay_factor < 1.0) {
            return Err(ScoreError::Config(format!(
                "decay_factor {} outside (0, 1)",
                p.decay_factor
            )));
        }
        if !(0.0..=1.0).contains(&p.neutral_deviation) {
            return Err(ScoreError::Config(format!(
                "neutral_deviation {} outside [0, 1]",
                p.neutral_deviation
            )));
        }
        if p.max_profiles == 0 {
            return Err(ScoreError::Config("max_profiles must be nonzero".into()));
        }

        if self.scoring_timeout_ms == 0 {
            return Err(ScoreError::Config("scoring_timeout_ms must be nonzero".into()));
        }
        if self.workers == 0 {
            return Err(ScoreError::Config("workers must be nonzero".into()));
        }
        Ok(())
    }
}

/// Shared handle to the live configuration.
///
/// Readers take cheap `Arc` snapshots; `replace` validates and then
/// swaps the whole struct, so a snapshot is always internally
/// consistent and a bad replacement never partially applies.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<EngineConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Validate and atomically install a replacement configuration.
    /// On error the previous configuration stays active.
    pub fn replace(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = Arc::new(config);
        info!("engine configuration replaced");
        Ok(())
    }
}
