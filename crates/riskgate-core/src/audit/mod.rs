//! Audit trail for risk assessments.
//!
//! Every assessment the pipeline produces is recorded, including
//! degraded ones. Delivery is fire-and-forget: a failing sink is
//! logged and never blocks or fails scoring.

pub mod file;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::event::BehaviorEvent;
use crate::risk::{ContributingFactor, Decision, RiskAssessment, RiskTier};

pub use file::FileAuditSink;

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_id: Uuid,
    pub user_id: String,
    /// Absent when the raw event failed validation.
    pub event_type: Option<String>,
    pub ip_address: Option<String>,
    pub raw_score: f64,
    pub risk_tier: RiskTier,
    pub decision: Decision,
    pub contributing_factors: Vec<ContributingFactor>,
    pub cold_start: bool,
    pub clock_skew_clamped: bool,
    pub degraded: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AuditRecord {
    /// Build a record from an assessment, carrying event context when
    /// the event survived normalization.
    pub fn from_assessment(assessment: &RiskAssessment, event: Option<&BehaviorEvent>) -> Self {
        Self {
            timestamp: assessment.timestamp,
            event_id: assessment.event_id,
            user_id: assessment.user_id.clone(),
            event_type: event.map(|e| e.event_type.as_str().to_string()),
            ip_address: event.map(|e| e.ip_address.to_string()),
            raw_score: assessment.raw_score,
            risk_tier: assessment.risk_tier,
            decision: assessment.decision,
            contributing_factors: assessment.contributing_factors.clone(),
            cold_start: assessment.cold_start,
            clock_skew_clamped: assessment.clock_skew_clamped,
            degraded: assessment.degraded.clone(),
            metadata: event.map(|e| e.metadata.clone()).unwrap_or_default(),
        }
    }
}

/// Filter for audit queries. Default matches everything, newest first.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub min_tier: Option<RiskTier>,
    pub decision: Option<Decision>,
    /// 0 means no limit.
    pub limit: usize,
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(from) = &self.from {
            if record.timestamp < *from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if record.timestamp > *to {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if record.user_id != *user_id {
                return false;
            }
        }
        if let Some(min_tier) = self.min_tier {
            if record.risk_tier < min_tier {
                return false;
            }
        }
        if let Some(decision) = self.decision {
            if record.decision != decision {
                return false;
            }
        }
        true
    }
}

/// Summary over the whole audit trail, rotated files included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_events: u64,
    pub by_tier: HashMap<String, u64>,
    pub by_decision: HashMap<String, u64>,
    pub degraded: u64,
    pub cold_start: u64,
    pub unique_users: u64,
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn log(&self, record: &AuditRecord) -> Result<()>;
}
