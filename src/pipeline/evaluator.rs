//! AKI risk evaluation
//!
//! Stateless: the same snapshot always yields the same decision.

use super::errors::EvaluationError;
use super::features::FeatureVector;
use super::model::{RiskModel, TreeEnsemble};
use super::types::{PatientSnapshot, RiskDecision};
use std::path::Path;

pub struct RiskEvaluator {
    with_demographics: Box<dyn RiskModel>,
    results_only: Box<dyn RiskModel>,
}

impl RiskEvaluator {
    pub fn new(
        with_demographics: Box<dyn RiskModel>,
        results_only: Box<dyn RiskModel>,
    ) -> Result<Self, EvaluationError> {
        if with_demographics.n_features() != 5 {
            return Err(EvaluationError::Model(format!(
                "demographic model must take 5 features, takes {}",
                with_demographics.n_features()
            )));
        }
        if results_only.n_features() != 3 {
            return Err(EvaluationError::Model(format!(
                "results-only model must take 3 features, takes {}",
                results_only.n_features()
            )));
        }
        Ok(Self {
            with_demographics,
            results_only,
        })
    }

    /// Load both model artifacts from disk
    pub fn load(
        with_demographics_path: impl AsRef<Path>,
        results_only_path: impl AsRef<Path>,
    ) -> Result<Self, EvaluationError> {
        Self::new(
            Box::new(TreeEnsemble::load(with_demographics_path)?),
            Box::new(TreeEnsemble::load(results_only_path)?),
        )
    }

    pub fn evaluate(&self, snapshot: &PatientSnapshot) -> Result<RiskDecision, EvaluationError> {
        let features = FeatureVector::from_snapshot(snapshot)?;
        let model = if features.has_demographics() {
            &self.with_demographics
        } else {
            &self.results_only
        };

        let positive = model.predict(&features.values())?;
        log::debug!(
            "MRN {} evaluated with {} model: {}",
            snapshot.mrn,
            if features.has_demographics() { "demographic" } else { "results-only" },
            if positive { "POSITIVE" } else { "negative" }
        );
        Ok(RiskDecision { positive })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::types::Sex;
    use chrono::{NaiveDate, NaiveDateTime};

    /// Positive when the latest result is at least `ratio` times the minimum
    pub(crate) struct RatioModel {
        pub n_features: usize,
        pub ratio: f64,
    }

    impl RiskModel for RatioModel {
        fn n_features(&self) -> usize {
            self.n_features
        }

        fn predict(&self, features: &[f64]) -> Result<bool, EvaluationError> {
            // latest is always third from the end, min last
            let latest = features[features.len() - 3];
            let min = features[features.len() - 1];
            Ok(min > 0.0 && latest / min >= self.ratio)
        }
    }

    pub(crate) fn ratio_evaluator(ratio: f64) -> RiskEvaluator {
        RiskEvaluator::new(
            Box::new(RatioModel { n_features: 5, ratio }),
            Box::new(RatioModel { n_features: 3, ratio }),
        )
        .unwrap()
    }

    struct Constant(usize, bool);

    impl RiskModel for Constant {
        fn n_features(&self) -> usize {
            self.0
        }
        fn predict(&self, _: &[f64]) -> Result<bool, EvaluationError> {
            Ok(self.1)
        }
    }

    fn snapshot(sex: Option<Sex>, latest: f64, min: f64) -> PatientSnapshot {
        PatientSnapshot {
            mrn: 100,
            sex,
            date_of_birth: NaiveDate::from_ymd_opt(1950, 1, 1),
            paged: false,
            min_result: min,
            mean_result: (latest + min) / 2.0,
            test_count: 2,
            latest_result: latest,
            latest_test_date: NaiveDateTime::parse_from_str(
                "2024-01-03 10:00:00",
                "%Y-%m-%d %H:%M:%S",
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_model_selected_by_demographics() {
        let evaluator = RiskEvaluator::new(
            Box::new(Constant(5, true)),
            Box::new(Constant(3, false)),
        )
        .unwrap();

        assert!(evaluator.evaluate(&snapshot(Some(Sex::Male), 1.0, 1.0)).unwrap().positive);
        assert!(!evaluator.evaluate(&snapshot(None, 1.0, 1.0)).unwrap().positive);
    }

    #[test]
    fn test_deterministic() {
        let evaluator = ratio_evaluator(1.5);
        let snap = snapshot(Some(Sex::Female), 200.0, 100.0);
        let first = evaluator.evaluate(&snap).unwrap();
        for _ in 0..10 {
            assert_eq!(evaluator.evaluate(&snap).unwrap(), first);
        }
        assert!(first.positive);
        assert!(!evaluator.evaluate(&snapshot(None, 120.0, 100.0)).unwrap().positive);
    }

    #[test]
    fn test_feature_count_mismatch_rejected() {
        assert!(RiskEvaluator::new(Box::new(Constant(3, true)), Box::new(Constant(3, true))).is_err());
        assert!(RiskEvaluator::new(Box::new(Constant(5, true)), Box::new(Constant(5, true))).is_err());
    }

    #[test]
    fn test_precondition_surfaces() {
        let evaluator = ratio_evaluator(1.5);
        let mut snap = snapshot(None, 1.0, 1.0);
        snap.test_count = 0;
        assert!(matches!(
            evaluator.evaluate(&snap),
            Err(EvaluationError::Precondition(_))
        ));
    }
}
