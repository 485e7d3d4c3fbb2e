//! Isolation-forest scoring over serialized tree artifacts.
//!
//! An artifact holds a manifest (feature names, per-feature importance
//! weights, training sample count) and an ensemble of binary trees.
//! Scoring walks each tree to find the event's isolation depth and
//! normalizes the average depth into a score in \[-1.0, 1.0\], where
//! more negative means more anomalous. Scoring is pure: the same
//! vector against the same artifact always yields the same score.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoreError};

/// Euler-Mascheroni constant, for the harmonic-number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// One node of an isolation tree. Children are indices into the tree's
/// node array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: u32,
    },
}

/// A single isolation tree; the root is node 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

/// A deserialized isolation-forest artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    /// Identifier assigned at training time.
    pub model_id: String,
    /// Feature names in positional order. Must match the engine's
    /// derived contract exactly.
    pub feature_names: Vec<String>,
    /// Per-feature importance weights, used to rank contributing
    /// factors. Same length and order as `feature_names`.
    pub importance: Vec<f64>,
    /// Subsample size used per tree at training time; normalizes path
    /// lengths.
    pub n_samples: u32,
    pub trees: Vec<Tree>,
}

impl ForestModel {
    /// Parse an artifact from its JSON form and check structural
    /// soundness. Feature-contract validation happens in the store.
    pub fn from_json(json: &str) -> Result<Self> {
        let model: ForestModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let incompatible = |msg: String| Err(ScoreError::ModelIncompatible(msg));
        if self.trees.is_empty() {
            return incompatible("artifact has no trees".into());
        }
        if self.n_samples < 2 {
            return incompatible(format!("n_samples = {} (need at least 2)", self.n_samples));
        }
        if self.importance.len() != self.feature_names.len() {
            return incompatible(format!(
                "{} importance weights for {} features",
                self.importance.len(),
                self.feature_names.len()
            ));
        }
        let n_features = self.feature_names.len();
        for (ti, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return incompatible(format!("tree {ti} is empty"));
            }
            for (ni, node) in tree.nodes.iter().enumerate() {
                if let TreeNode::Split {
                    feature,
                    left,
                    right,
                    threshold,
                } = node
                {
                    if *feature >= n_features {
                        return incompatible(format!(
                            "tree {ti} node {ni} splits on feature {feature} of {n_features}"
                        ));
                    }
                    if *left >= tree.nodes.len() || *right >= tree.nodes.len() {
                        return incompatible(format!(
                            "tree {ti} node {ni} has out-of-range child"
                        ));
                    }
                    if *left <= ni || *right <= ni {
                        return incompatible(format!("tree {ti} node {ni} has a backward edge"));
                    }
                    if !threshold.is_finite() {
                        return incompatible(format!("tree {ti} node {ni} threshold not finite"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Score a feature vector. Returns a value in \[-1.0, 1.0\]; more
    /// negative means shorter isolation paths, i.e. more anomalous.
    pub fn score(&self, features: &[f64]) -> Result<f64> {
        if features.len() != self.feature_names.len() {
            return Err(ScoreError::ModelIncompatible(format!(
                "feature vector has {} values, model expects {}",
                features.len(),
                self.feature_names.len()
            )));
        }
        let total: f64 = self.trees.iter().map(|t| path_length(t, features)).sum();
        let avg = total / self.trees.len() as f64;
        // Standard anomaly score s = 2^(-E[h]/c(n)) in (0, 1], mapped
        // linearly onto [-1, 1).
        let s = 2f64.powf(-avg / average_path_length(self.n_samples as f64));
        Ok(1.0 - 2.0 * s)
    }
}

impl super::AnomalyModel for ForestModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn importance(&self) -> &[f64] {
        &self.importance
    }

    fn score(&self, features: &[f64]) -> Result<f64> {
        ForestModel::score(self, features)
    }
}

fn path_length(tree: &Tree, features: &[f64]) -> f64 {
    let mut idx = 0usize;
    let mut depth = 0.0;
    loop {
        match &tree.nodes[idx] {
            TreeNode::Leaf { size } => return depth + average_path_length(*size as f64),
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                depth += 1.0;
                idx = if features[*feature] < *threshold {
                    *left
                } else {
                    *right
                };
            }
        }
    }
}

/// c(n): expected path length of an unsuccessful BST search over n
/// points, the isolation-forest normalizer.
fn average_path_length(n: f64) -> f64 {
    if n <= 1.0 {
        return 0.0;
    }
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One tree: feature 0 below 0.5 reaches a dense leaf, at or above
    /// 0.5 is isolated immediately.
    fn toy_model_json() -> String {
        serde_json::json!({
            "model_id": "toy-v1",
            "feature_names": ["f0", "f1"],
            "importance": [0.8, 0.2],
            "n_samples": 256,
            "trees": [
                {
                    "nodes": [
                        {"feature": 0, "threshold": 0.5, "left": 1, "right": 2},
                        {"size": 128},
                        {"size": 1}
                    ]
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn test_isolated_point_scores_more_negative() {
        let model = ForestModel::from_json(&toy_model_json()).unwrap();
        let normal = model.score(&[0.0, 0.0]).unwrap();
        let anomalous = model.score(&[1.0, 0.0]).unwrap();
        assert!(anomalous < normal);
        assert!(anomalous < -0.5, "isolated point scored {anomalous}");
    }

    #[test]
    fn test_score_in_range_and_deterministic() {
        let model = ForestModel::from_json(&toy_model_json()).unwrap();
        for v in [[0.0, 0.0], [0.49, 3.0], [0.5, -1.0], [100.0, 100.0]] {
            let a = model.score(&v).unwrap();
            let b = model.score(&v).unwrap();
            assert_eq!(a, b);
            assert!((-1.0..=1.0).contains(&a), "score {a} out of range");
        }
    }

    #[test]
    fn test_wrong_vector_length_rejected() {
        let model = ForestModel::from_json(&toy_model_json()).unwrap();
        assert!(matches!(
            model.score(&[0.0]),
            Err(ScoreError::ModelIncompatible(_))
        ));
    }

    #[test]
    fn test_out_of_range_child_rejected() {
        let bad = serde_json::json!({
            "model_id": "bad",
            "feature_names": ["f0"],
            "importance": [1.0],
            "n_samples": 16,
            "trees": [{"nodes": [
                {"feature": 0, "threshold": 0.5, "left": 1, "right": 9}
            ]}]
        })
        .to_string();
        assert!(matches!(
            ForestModel::from_json(&bad),
            Err(ScoreError::ModelIncompatible(_))
        ));
    }

    #[test]
    fn test_importance_length_mismatch_rejected() {
        let bad = serde_json::json!({
            "model_id": "bad",
            "feature_names": ["f0", "f1"],
            "importance": [1.0],
            "n_samples": 16,
            "trees": [{"nodes": [{"size": 4}]}]
        })
        .to_string();
        assert!(matches!(
            ForestModel::from_json(&bad),
            Err(ScoreError::ModelIncompatible(_))
        ));
    }

    #[test]
    fn test_malformed_json_is_deserialize_error() {
        assert!(matches!(
            ForestModel::from_json("{not json"),
            Err(ScoreError::Deserialize(_))
        ));
    }

    #[test]
    fn test_average_path_length_edge_cases() {
        assert_eq!(average_path_length(0.0), 0.0);
        assert_eq!(average_path_length(1.0), 0.0);
        assert!(average_path_length(2.0) > 0.0);
        assert!(average_path_length(256.0) > average_path_length(128.0));
    }
}
