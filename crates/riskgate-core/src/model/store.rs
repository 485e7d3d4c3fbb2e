//! Atomic model storage with validate-before-swap loading.

use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::{Result, ScoreError};

use super::forest::ForestModel;
use super::AnomalyModel;

/// Holds the active anomaly model behind an atomic snapshot.
///
/// `active()` hands out an `Arc` clone, so in-flight scoring completes
/// against whichever model it snapshotted even if a swap lands
/// mid-score. A rejected artifact never disturbs the active model.
pub struct ModelStore {
    expected_features: Vec<String>,
    active: RwLock<Option<Arc<dyn AnomalyModel>>>,
}

impl ModelStore {
    /// An empty store expecting the given feature contract. Scoring
    /// fails with `ModelUnavailable` until the first successful load.
    pub fn new(expected_features: Vec<String>) -> Self {
        Self {
            expected_features,
            active: RwLock::new(None),
        }
    }

    /// Parse, validate, and atomically activate a forest artifact.
    ///
    /// On any failure the previous model (if any) stays active and the
    /// error is returned.
    pub fn load(&self, artifact_json: &str) -> Result<()> {
        let model = ForestModel::from_json(artifact_json).map_err(|e| {
            warn!(error = %e, "model artifact rejected");
            e
        })?;
        self.install(Arc::new(model))
    }

    /// Validate a model's feature signature against the expected
    /// contract and atomically activate it.
    pub fn install(&self, model: Arc<dyn AnomalyModel>) -> Result<()> {
        if model.feature_names() != self.expected_features {
            let err = ScoreError::ModelIncompatible(format!(
                "feature signature mismatch: artifact has {:?}, engine expects {:?}",
                model.feature_names(),
                self.expected_features
            ));
            warn!(model_id = %model.model_id(), error = %err, "model rejected");
            return Err(err);
        }

        let model_id = model.model_id().to_string();
        let mut slot = self.active.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(model);
        info!(%model_id, "anomaly model activated");
        Ok(())
    }

    /// Snapshot of the active model, if any.
    pub fn active(&self) -> Option<Arc<dyn AnomalyModel>> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn expected_features(&self) -> &[String] {
        &self.expected_features
    }
}
