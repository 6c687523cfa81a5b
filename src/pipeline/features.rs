//! Feature vector construction for risk scoring
//!
//! Demographics decide which model applies: both age and sex known selects
//! the five-feature vector, anything less falls back to the results-only one.

use super::errors::EvaluationError;
use super::types::PatientSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureVector {
    /// `[age, sex, latest, mean, min]`
    WithDemographics {
        age: f64,
        sex: f64,
        latest: f64,
        mean: f64,
        min: f64,
    },
    /// `[latest, mean, min]`
    ResultsOnly { latest: f64, mean: f64, min: f64 },
}

impl FeatureVector {
    pub fn from_snapshot(snapshot: &PatientSnapshot) -> Result<Self, EvaluationError> {
        if snapshot.test_count < 1 {
            return Err(EvaluationError::Precondition(format!(
                "MRN {} has no recorded tests",
                snapshot.mrn
            )));
        }

        let latest = snapshot.latest_result;
        let mean = snapshot.mean_result;
        let min = snapshot.min_result;

        Ok(match (snapshot.age_at_latest_test(), snapshot.sex) {
            (Some(age), Some(sex)) => FeatureVector::WithDemographics {
                age: age as f64,
                sex: sex.encoded(),
                latest,
                mean,
                min,
            },
            _ => FeatureVector::ResultsOnly { latest, mean, min },
        })
    }

    pub fn has_demographics(&self) -> bool {
        matches!(self, FeatureVector::WithDemographics { .. })
    }

    pub fn values(&self) -> Vec<f64> {
        match *self {
            FeatureVector::WithDemographics {
                age,
                sex,
                latest,
                mean,
                min,
            } => vec![age, sex, latest, mean, min],
            FeatureVector::ResultsOnly { latest, mean, min } => vec![latest, mean, min],
        }
    }
}
