//! Anomaly model artifacts and the hot-swappable model store.
//!
//! Models are trained offline and shipped as JSON artifacts. The
//! feature contract is positional: the artifact's `feature_names` must
//! match the names the engine derives from its configuration, in
//! order, or the artifact is rejected.

pub mod forest;
pub mod store;

pub use forest::ForestModel;
pub use store::ModelStore;

use crate::behavioral::DeviationVector;
use crate::error::Result;
use crate::event::EventType;
use crate::velocity::WindowCounts;

/// A scorable anomaly model. [`ForestModel`] is the production
/// implementation; the seam exists so scoring backends can be swapped
/// without touching the store or the engine.
pub trait AnomalyModel: Send + Sync {
    fn model_id(&self) -> &str;
    /// Positional feature contract this model was trained against.
    fn feature_names(&self) -> &[String];
    /// Per-feature importance weights, same order as `feature_names`.
    fn importance(&self) -> &[f64];
    /// Score a feature vector into \[-1.0, 1.0\]; more negative means
    /// more anomalous. Must be deterministic.
    fn score(&self, features: &[f64]) -> Result<f64>;
}

/// Deviation signal names, in the order [`DeviationVector::as_features`]
/// emits them.
pub const DEVIATION_FEATURES: [&str; 4] = [
    "hour_deviation",
    "device_deviation",
    "ip_deviation",
    "action_mix_deviation",
];

/// The canonical feature-name contract for a given set of velocity
/// windows: user window counts (total, logins, distinct IPs), IP window
/// counts, deviation signals, then event-type one-hots.
pub fn feature_names(windows_secs: &[u64]) -> Vec<String> {
    let mut names = Vec::new();
    for w in windows_secs {
        names.push(format!("user_events_{w}s"));
    }
    for w in windows_secs {
        names.push(format!("user_logins_{w}s"));
    }
    for w in windows_secs {
        names.push(format!("user_ips_{w}s"));
    }
    for w in windows_secs {
        names.push(format!("ip_events_{w}s"));
    }
    names.extend(DEVIATION_FEATURES.iter().map(|s| s.to_string()));
    names.extend(EventType::ALL.iter().map(|t| format!("type_{}", t.as_str())));
    names
}

/// Assemble the feature vector for one event, in contract order.
pub fn assemble_features(
    user_counts: &WindowCounts,
    ip_counts: &WindowCounts,
    deviation: &DeviationVector,
    event_type: EventType,
) -> Vec<f64> {
    let mut v = Vec::with_capacity(
        3 * user_counts.counts.len() + ip_counts.counts.len() + 4 + EventType::ALL.len(),
    );
    v.extend(user_counts.counts.iter().map(|c| *c as f64));
    v.extend(user_counts.logins.iter().map(|c| *c as f64));
    v.extend(user_counts.distinct_sources.iter().map(|c| *c as f64));
    v.extend(ip_counts.counts.iter().map(|c| *c as f64));
    v.extend(deviation.as_features());
    v.extend(
        EventType::ALL
            .iter()
            .map(|t| if *t == event_type { 1.0 } else { 0.0 }),
    );
    v
}
