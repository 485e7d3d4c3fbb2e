//! Raw event validation and shaping.
//!
//! [`normalize`] turns an untyped JSON record into a canonical
//! [`BehaviorEvent`], or fails with a validation error naming the
//! offending field. It never partially normalizes and has no side
//! effects.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, ScoreError};

use super::{BehaviorEvent, EventType};

/// Validate and shape a raw JSON record into a [`BehaviorEvent`].
///
/// Required fields: `user_id` (non-empty string), `timestamp` (RFC 3339
/// string or epoch seconds), `event_type` (known kind), `ip_address`
/// (syntactically valid v4/v6). Optional: `event_id` (UUID),
/// `device_fingerprint`, `metadata` (string map).
pub fn normalize(raw: &Value) -> Result<BehaviorEvent> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ScoreError::validation("event", "not a JSON object"))?;

    let user_id = match obj.get("user_id").and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        Some(_) => return Err(ScoreError::validation("user_id", "empty")),
        None => return Err(ScoreError::validation("user_id", "missing or not a string")),
    };

    let timestamp = parse_timestamp(obj.get("timestamp"))?;

    let event_type = match obj.get("event_type").and_then(Value::as_str) {
        Some(s) => EventType::parse(s)
            .ok_or_else(|| ScoreError::validation("event_type", format!("unknown kind `{s}`")))?,
        None => {
            return Err(ScoreError::validation(
                "event_type",
                "missing or not a string",
            ))
        }
    };

    let ip_address: IpAddr = match obj.get("ip_address").and_then(Value::as_str) {
        Some(s) => s
            .parse()
            .map_err(|_| ScoreError::validation("ip_address", format!("`{s}` is not an IP address")))?,
        None => {
            return Err(ScoreError::validation(
                "ip_address",
                "missing or not a string",
            ))
        }
    };

    let event_id = match obj.get("event_id") {
        Some(Value::String(s)) => s
            .parse::<Uuid>()
            .map_err(|_| ScoreError::validation("event_id", format!("`{s}` is not a UUID")))?,
        Some(_) => return Err(ScoreError::validation("event_id", "not a string")),
        None => Uuid::new_v4(),
    };

    let device_fingerprint = match obj.get("device_fingerprint") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(Value::String(_)) => None,
        Some(_) => return Err(ScoreError::validation("device_fingerprint", "not a string")),
    };

    let mut metadata = HashMap::new();
    if let Some(meta) = obj.get("metadata") {
        let map = meta
            .as_object()
            .ok_or_else(|| ScoreError::validation("metadata", "not an object"))?;
        for (k, v) in map {
            let s = v
                .as_str()
                .ok_or_else(|| ScoreError::validation("metadata", format!("value for `{k}` is not a string")))?;
            metadata.insert(k.clone(), s.to_string());
        }
    }

    Ok(BehaviorEvent {
        event_id,
        user_id,
        timestamp,
        event_type,
        ip_address,
        device_fingerprint,
        metadata,
    })
}

fn parse_timestamp(value: Option<&Value>) -> Result<DateTime<Utc>> {
    match value {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ScoreError::validation("timestamp", format!("`{s}`: {e}"))),
        Some(Value::Number(n)) => {
            let secs = n
                .as_i64()
                .ok_or_else(|| ScoreError::validation("timestamp", "not an integer epoch"))?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| ScoreError::validation("timestamp", format!("epoch {secs} out of range")))
        }
        Some(_) => Err(ScoreError::validation(
            "timestamp",
            "not a string or number",
        )),
        None => Err(ScoreError::validation("timestamp", "missing")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_raw() -> Value {
        json!({
            "user_id": "user-001",
            "timestamp": "2025-06-01T09:30:00Z",
            "event_type": "login",
            "ip_address": "203.0.113.10",
            "device_fingerprint": "fp-abc",
            "metadata": {"session": "s-1"}
        })
    }

    #[test]
    fn test_normalize_valid_event() {
        let event = normalize(&valid_raw()).unwrap();
        assert_eq!(event.user_id, "user-001");
        assert_eq!(event.event_type, EventType::Login);
        assert_eq!(event.ip_address.to_string(), "203.0.113.10");
        assert_eq!(event.device_fingerprint.as_deref(), Some("fp-abc"));
        assert_eq!(event.metadata["session"], "s-1");
        assert_eq!(event.hour_of_day(), 9);
    }

    #[test]
    fn test_epoch_timestamp_accepted() {
        let mut raw = valid_raw();
        raw["timestamp"] = json!(1_700_000_000);
        let event = normalize(&raw).unwrap();
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_missing_user_id_names_field() {
        let mut raw = valid_raw();
        raw.as_object_mut().unwrap().remove("user_id");
        let err = normalize(&raw).unwrap_err();
        match err {
            ScoreError::Validation { field, .. } => assert_eq!(field, "user_id"),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let mut raw = valid_raw();
        raw["user_id"] = json!("   ");
        assert!(matches!(
            normalize(&raw),
            Err(ScoreError::Validation { field: "user_id", .. })
        ));
    }

    #[test]
    fn test_bad_ip_rejected() {
        let mut raw = valid_raw();
        raw["ip_address"] = json!("999.1.2.3");
        assert!(matches!(
            normalize(&raw),
            Err(ScoreError::Validation { field: "ip_address", .. })
        ));
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let mut raw = valid_raw();
        raw["event_type"] = json!("teleport");
        assert!(matches!(
            normalize(&raw),
            Err(ScoreError::Validation { field: "event_type", .. })
        ));
    }

    #[test]
    fn test_unparseable_timestamp_rejected() {
        let mut raw = valid_raw();
        raw["timestamp"] = json!("yesterday-ish");
        assert!(matches!(
            normalize(&raw),
            Err(ScoreError::Validation { field: "timestamp", .. })
        ));
    }

    #[test]
    fn test_event_id_generated_when_absent() {
        let a = normalize(&valid_raw()).unwrap();
        let b = normalize(&valid_raw()).unwrap();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_ipv6_accepted() {
        let mut raw = valid_raw();
        raw["ip_address"] = json!("2001:db8::1");
        let event = normalize(&raw).unwrap();
        assert!(event.ip_address.is_ipv6());
    }

    #[test]
    fn test_non_string_metadata_value_rejected() {
        let mut raw = valid_raw();
        raw["metadata"] = json!({"count": 3});
        assert!(matches!(
            normalize(&raw),
            Err(ScoreError::Validation { field: "metadata", .. })
        ));
    }
}
