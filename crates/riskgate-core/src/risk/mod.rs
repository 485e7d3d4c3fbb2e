//! Risk tiers, decisions, and the scoring engine.
//!
//! The engine turns an event's velocity counts and behavioral
//! deviations into a feature vector, scores it against the active
//! anomaly model, and calibrates the raw score into a tier and an
//! allow/flag/block decision. Tier calibration and the tier-to-decision
//! policy are separate tables so responses can be retuned without
//! touching score thresholds.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::behavioral::DeviationVector;
use crate::error::{Result, ScoreError};
use crate::event::BehaviorEvent;
use crate::model::{assemble_features, AnomalyModel, ModelStore};
use crate::velocity::WindowCounts;

/// Calibrated severity band for a raw anomaly score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

/// What the pipeline tells the caller to do with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Flag,
    Block,
}

/// Raw-score cut points for tier calibration. Scores are in
/// \[-1.0, 1.0\] with more negative meaning more anomalous, so the
/// bounds must be strictly increasing: `critical_below < high_below <
/// medium_below`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    /// Scores at or below this are Critical.
    pub critical_below: f64,
    /// Scores at or below this (and above critical) are High.
    pub high_below: f64,
    /// Scores at or below this (and above high) are Medium; anything
    /// higher is Low.
    pub medium_below: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            critical_below: -0.6,
            high_below: -0.3,
            medium_below: -0.1,
        }
    }
}

impl TierThresholds {
    pub fn tier(&self, raw_score: f64) -> RiskTier {
        if raw_score <= self.critical_below {
            RiskTier::Critical
        } else if raw_score <= self.high_below {
            RiskTier::High
        } else if raw_score <= self.medium_below {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.critical_below < self.high_below && self.high_below < self.medium_below) {
            return Err(ScoreError::Config(format!(
                "tier thresholds must be strictly increasing: {} < {} < {}",
                self.critical_below, self.high_below, self.medium_below
            )));
        }
        for v in [self.critical_below, self.high_below, self.medium_below] {
            if !(-1.0..=1.0).contains(&v) {
                return Err(ScoreError::Config(format!(
                    "tier threshold {v} outside [-1.0, 1.0]"
                )));
            }
        }
        Ok(())
    }
}

/// The action taken per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    pub low: Decision,
    pub medium: Decision,
    pub high: Decision,
    pub critical: Decision,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            low: Decision::Allow,
            medium: Decision::Allow,
            high: Decision::Flag,
            critical: Decision::Block,
        }
    }
}

impl DecisionPolicy {
    pub fn decision(&self, tier: RiskTier) -> Decision {
        match tier {
            RiskTier::Low => self.low,
            RiskTier::Medium => self.medium,
            RiskTier::High => self.high,
            RiskTier::Critical => self.critical,
        }
    }
}

/// One feature's contribution to an assessment, ranked by
/// |value x importance|.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingFactor {
    pub feature: String,
    pub value: f64,
    pub weight: f64,
}

/// The pipeline's verdict on a single event. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub event_id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// Raw model score in \[-1.0, 1.0\]; 0.0 for degraded assessments.
    pub raw_score: f64,
    pub risk_tier: RiskTier,
    pub decision: Decision,
    /// Top-ranked features behind the score, most influential first.
    pub contributing_factors: Vec<ContributingFactor>,
    /// The user had too little history for behavioral signals.
    pub cold_start: bool,
    /// The event's timestamp was clamped for clock skew.
    pub clock_skew_clamped: bool,
    /// Set when scoring failed and the fallback decision was applied;
    /// holds the error description.
    pub degraded: Option<String>,
}

impl RiskAssessment {
    /// Build the fallback assessment for an event that could not be
    /// scored. The tier mirrors the fallback decision so downstream
    /// tier filters behave sensibly.
    pub fn degraded(
        event_id: Uuid,
        user_id: String,
        timestamp: DateTime<Utc>,
        fallback: Decision,
        error: &ScoreError,
    ) -> Self {
        let risk_tier = match fallback {
            Decision::Allow => RiskTier::Low,
            Decision::Flag => RiskTier::Medium,
            Decision::Block => RiskTier::Critical,
        };
        Self {
            event_id,
            user_id,
            timestamp,
            raw_score: 0.0,
            risk_tier,
            decision: fallback,
            contributing_factors: Vec::new(),
            cold_start: false,
            clock_skew_clamped: false,
            degraded: Some(error.to_string()),
        }
    }
}

/// A snapshotted scoring unit: safe to ship into a blocking task, and
/// unaffected by model swaps that land while it runs.
pub struct ScoreJob {
    model: Arc<dyn AnomalyModel>,
    features: Vec<f64>,
}

/// Raw score plus ranked factors, produced by [`ScoreJob::run`].
pub struct ScoredVector {
    pub raw_score: f64,
    pub factors: Vec<ContributingFactor>,
}

impl ScoreJob {
    pub fn run(self) -> Result<ScoredVector> {
        let raw_score = self.model.score(&self.features)?;
        Ok(ScoredVector {
            raw_score,
            factors: rank_factors(self.model.as_ref(), &self.features),
        })
    }
}

/// How many contributing factors an assessment carries.
const TOP_FACTORS: usize = 3;

fn rank_factors(model: &dyn AnomalyModel, features: &[f64]) -> Vec<ContributingFactor> {
    let mut ranked: Vec<(usize, f64)> = features
        .iter()
        .zip(model.importance())
        .map(|(v, w)| (v * w).abs())
        .enumerate()
        .collect();
    // Descending by magnitude; feature order breaks ties so rankings
    // are stable across runs.
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(TOP_FACTORS)
        .filter(|(_, magnitude)| *magnitude > 0.0)
        .map(|(i, _)| ContributingFactor {
            feature: model.feature_names()[i].clone(),
            value: features[i],
            weight: model.importance()[i],
        })
        .collect()
}

/// Scores events against the active model.
pub struct RiskEngine {
    store: Arc<ModelStore>,
}

impl RiskEngine {
    pub fn new(store: Arc<ModelStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    /// Snapshot the active model and assemble the event's feature
    /// vector. `ModelUnavailable` when no model has been loaded.
    pub fn prepare(
        &self,
        event: &BehaviorEvent,
        user_counts: &WindowCounts,
        ip_counts: &WindowCounts,
        deviation: &DeviationVector,
    ) -> Result<ScoreJob> {
        let model = self.store.active().ok_or(ScoreError::ModelUnavailable)?;
        let features = assemble_features(user_counts, ip_counts, deviation, event.event_type);
        if features.len() != model.feature_names().len() {
            return Err(ScoreError::ModelIncompatible(format!(
                "assembled {} features, model expects {}",
                features.len(),
                model.feature_names().len()
            )));
        }
        Ok(ScoreJob { model, features })
    }

    /// Calibrate a scored vector into the final assessment.
    pub fn finalize(
        &self,
        event: &BehaviorEvent,
        scored: ScoredVector,
        thresholds: &TierThresholds,
        policy: &DecisionPolicy,
        cold_start: bool,
        clock_skew_clamped: bool,
    ) -> RiskAssessment {
        let risk_tier = thresholds.tier(scored.raw_score);
        RiskAssessment {
            event_id: event.event_id,
            user_id: event.user_id.clone(),
            timestamp: event.timestamp,
            raw_score: scored.raw_score,
            risk_tier,
            decision: policy.decision(risk_tier),
            contributing_factors: scored.factors,
            cold_start,
            clock_skew_clamped,
            degraded: None,
        }
    }

    /// Prepare, score, and finalize in one call, without the pipeline's
    /// timeout envelope.
    pub fn assess(
        &self,
        event: &BehaviorEvent,
        user_counts: &WindowCounts,
        ip_counts: &WindowCounts,
        deviation: &DeviationVector,
        thresholds: &TierThresholds,
        policy: &DecisionPolicy,
    ) -> Result<RiskAssessment> {
        let job = self.prepare(event, user_counts, ip_counts, deviation)?;
        let scored = job.run()?;
        Ok(self.finalize(
            event,
            scored,
            thresholds,
            policy,
            deviation.cold_start,
            user_counts.clamped || ip_counts.clamped,
        ))
    }
}
