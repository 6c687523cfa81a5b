//! Pre-trained classifier artifacts
//!
//! Models are exported offline as JSON tree ensembles:
//!
//! ```json
//! {
//!   "n_features": 3,
//!   "trees": [
//!     { "nodes": [
//!         { "feature": 0, "threshold": 150.0, "left": 1, "right": 2 },
//!         { "value": 0.0 },
//!         { "value": 1.0 }
//!     ] }
//!   ]
//! }
//! ```
//!
//! A split sends `x[feature] <= threshold` left. The ensemble score is the
//! mean leaf value across trees; a score of 0.5 or more is positive.

use super::errors::EvaluationError;
use serde::{Deserialize, Serialize};
use std::path::Path;

const POSITIVE_THRESHOLD: f64 = 0.5;

/// Scoring interface shared by both models
pub trait RiskModel: Send + Sync {
    /// Number of features the model was trained on
    fn n_features(&self) -> usize;

    /// Binary prediction for one feature row
    fn predict(&self, features: &[f64]) -> Result<bool, EvaluationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn score(&self, features: &[f64]) -> Result<f64, EvaluationError> {
        let mut idx = 0;
        // A valid tree reaches a leaf in fewer steps than it has nodes
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { value }) => return Ok(*value),
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let x = features.get(*feature).ok_or_else(|| {
                        EvaluationError::Model(format!("feature index {} out of range", feature))
                    })?;
                    idx = if *x <= *threshold { *left } else { *right };
                }
                None => {
                    return Err(EvaluationError::Model(format!("node {} does not exist", idx)))
                }
            }
        }
        Err(EvaluationError::Model("tree contains a cycle".to_string()))
    }

    fn validate(&self, n_features: usize) -> Result<(), EvaluationError> {
        if self.nodes.is_empty() {
            return Err(EvaluationError::Model("empty tree".to_string()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split {
                feature,
                left,
                right,
                ..
            } = node
            {
                if *feature >= n_features {
                    return Err(EvaluationError::Model(format!(
                        "node {} uses feature {} but model has {}",
                        i, feature, n_features
                    )));
                }
                if *left >= self.nodes.len() || *right >= self.nodes.len() {
                    return Err(EvaluationError::Model(format!(
                        "node {} points outside the tree",
                        i
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub n_features: usize,
    pub trees: Vec<DecisionTree>,
}

impl TreeEnsemble {
    pub fn from_json(json: &str) -> Result<Self, EvaluationError> {
        let model: TreeEnsemble = serde_json::from_str(json)
            .map_err(|e| EvaluationError::Model(format!("invalid model JSON: {}", e)))?;
        if model.trees.is_empty() {
            return Err(EvaluationError::Model("model has no trees".to_string()));
        }
        for tree in &model.trees {
            tree.validate(model.n_features)?;
        }
        Ok(model)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvaluationError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EvaluationError::Model(format!("cannot read {}: {}", path.display(), e))
        })?;
        let model = Self::from_json(&json)?;
        log::info!(
            "Loaded model {} ({} trees, {} features)",
            path.display(),
            model.trees.len(),
            model.n_features
        );
        Ok(model)
    }
}

impl RiskModel for TreeEnsemble {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict(&self, features: &[f64]) -> Result<bool, EvaluationError> {
        if features.len() != self.n_features {
            return Err(EvaluationError::Model(format!(
                "expected {} features, got {}",
                self.n_features,
                features.len()
            )));
        }
        let mut total = 0.0;
        for tree in &self.trees {
            total += tree.score(features)?;
        }
        Ok(total / self.trees.len() as f64 >= POSITIVE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUMP: &str = r#"{
        "n_features": 3,
        "trees": [
            { "nodes": [
                { "feature": 0, "threshold": 150.0, "left": 1, "right": 2 },
                { "value": 0.0 },
                { "value": 1.0 }
            ] }
        ]
    }"#;

    #[test]
    fn test_stump_predicts() {
        let model = TreeEnsemble::from_json(STUMP).unwrap();
        assert!(!model.predict(&[150.0, 100.0, 90.0]).unwrap());
        assert!(model.predict(&[150.1, 100.0, 90.0]).unwrap());
    }

    #[test]
    fn test_ensemble_majority() {
        let json = r#"{
            "n_features": 1,
            "trees": [
                { "nodes": [ { "value": 1.0 } ] },
                { "nodes": [ { "value": 0.0 } ] },
                { "nodes": [ { "feature": 0, "threshold": 1.0, "left": 1, "right": 2 },
                             { "value": 0.0 }, { "value": 1.0 } ] }
            ]
        }"#;
        let model = TreeEnsemble::from_json(json).unwrap();
        assert!(model.predict(&[2.0]).unwrap());
        assert!(!model.predict(&[0.5]).unwrap());
    }

    #[test]
    fn test_wrong_feature_count() {
        let model = TreeEnsemble::from_json(STUMP).unwrap();
        assert!(matches!(
            model.predict(&[1.0, 2.0, 3.0, 4.0, 5.0]),
            Err(EvaluationError::Model(_))
        ));
    }

    #[test]
    fn test_invalid_artifacts_rejected() {
        assert!(TreeEnsemble::from_json("not json").is_err());
        assert!(TreeEnsemble::from_json(r#"{"n_features": 3, "trees": []}"#).is_err());

        let bad_child = r#"{"n_features": 1, "trees": [ { "nodes": [
            { "feature": 0, "threshold": 1.0, "left": 1, "right": 7 }, { "value": 0.0 } ] } ]}"#;
        assert!(TreeEnsemble::from_json(bad_child).is_err());

        let bad_feature = r#"{"n_features": 1, "trees": [ { "nodes": [
            { "feature": 4, "threshold": 1.0, "left": 1, "right": 1 }, { "value": 0.0 } ] } ]}"#;
        assert!(TreeEnsemble::from_json(bad_feature).is_err());
    }

    #[test]
    fn test_cycle_detected() {
        let cyclic = TreeEnsemble {
            n_features: 1,
            trees: vec![DecisionTree {
                nodes: vec![TreeNode::Split {
                    feature: 0,
                    threshold: 0.0,
                    left: 0,
                    right: 0,
                }],
            }],
        };
        assert!(cyclic.predict(&[1.0]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, STUMP).unwrap();
        assert_eq!(TreeEnsemble::load(&path).unwrap().n_features(), 3);
        assert!(TreeEnsemble::load(dir.path().join("missing.json")).is_err());
    }
}
