//! Canonical behavior events and raw-event normalization.

pub mod normalizer;

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use normalizer::normalize;

/// The kind of user activity an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Login,
    Logout,
    Action,
    Transaction,
    Download,
    ApiAccess,
}

impl EventType {
    /// All event types, in the order used for one-hot feature encoding.
    pub const ALL: [EventType; 6] = [
        EventType::Login,
        EventType::Logout,
        EventType::Action,
        EventType::Transaction,
        EventType::Download,
        EventType::ApiAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Login => "login",
            EventType::Logout => "logout",
            EventType::Action => "action",
            EventType::Transaction => "transaction",
            EventType::Download => "download",
            EventType::ApiAccess => "api_access",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

/// A single validated user activity event. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorEvent {
    /// Unique event identifier (assigned at normalization if absent).
    pub event_id: Uuid,
    /// The acting user. Never empty.
    pub user_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What kind of activity this was.
    pub event_type: EventType,
    /// Source address.
    pub ip_address: IpAddr,
    /// Client device fingerprint, if the transport supplied one.
    pub device_fingerprint: Option<String>,
    /// Opaque key/value context carried through to the audit record.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl BehaviorEvent {
    /// Hour of day (0-23) in UTC, used by the behavior profiler.
    pub fn hour_of_day(&self) -> usize {
        use chrono::Timelike;
        self.timestamp.hour() as usize
    }
}
