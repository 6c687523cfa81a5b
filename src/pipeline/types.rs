//! Core data structures shared across the pipeline

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Medical record number
pub type Mrn = i64;

/// Recorded sex of a patient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    /// Parse the PID-8 code. Anything other than M/F is unknown.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "M" => Some(Sex::Male),
            "F" => Some(Sex::Female),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
        }
    }

    /// Model encoding: M=0, F=1
    pub fn encoded(&self) -> f64 {
        match self {
            Sex::Male => 0.0,
            Sex::Female => 1.0,
        }
    }
}

/// Demographic registration from an ADT^A01
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionEvent {
    pub mrn: Mrn,
    pub sex: Option<Sex>,
    pub date_of_birth: Option<NaiveDate>,
}

/// A single creatinine measurement from an ORU^R01
#[derive(Debug, Clone, PartialEq)]
pub struct LabResultEvent {
    pub mrn: Mrn,
    pub test_date: NaiveDateTime,
    pub result: f64,
    /// OBR-7 exactly as received, forwarded to the pager
    pub raw_test_time: String,
}

/// Structured content of one frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClinicalEvent {
    Admission(AdmissionEvent),
    LabResult(LabResultEvent),
    /// Lab result for a test other than creatinine
    Discarded { mrn: Mrn, test_code: String },
    /// Discharges and message types that need only an acknowledgement
    DischargeOrUnhandled { message_type: String },
}

/// Consistent view of a patient right after a store mutation
#[derive(Debug, Clone, PartialEq)]
pub struct PatientSnapshot {
    pub mrn: Mrn,
    pub sex: Option<Sex>,
    pub date_of_birth: Option<NaiveDate>,
    pub paged: bool,
    pub min_result: f64,
    pub mean_result: f64,
    pub test_count: i64,
    pub latest_result: f64,
    pub latest_test_date: NaiveDateTime,
}

impl PatientSnapshot {
    /// Age in whole years on the date of the latest test
    pub fn age_at_latest_test(&self) -> Option<u32> {
        let dob = self.date_of_birth?;
        let on = self.latest_test_date.date();
        if on < dob {
            return None;
        }
        let mut years = on.year() - dob.year();
        if (on.month(), on.day()) < (dob.month(), dob.day()) {
            years -= 1;
        }
        u32::try_from(years).ok()
    }
}

/// Outcome of a risk evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskDecision {
    pub positive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(dob: Option<NaiveDate>, test_date: &str) -> PatientSnapshot {
        PatientSnapshot {
            mrn: 1,
            sex: Some(Sex::Female),
            date_of_birth: dob,
            paged: false,
            min_result: 1.0,
            mean_result: 1.0,
            test_count: 1,
            latest_result: 1.0,
            latest_test_date: NaiveDateTime::parse_from_str(test_date, "%Y-%m-%d %H:%M:%S")
                .unwrap(),
        }
    }

    #[test]
    fn test_age_uses_test_date_and_birthday() {
        let dob = NaiveDate::from_ymd_opt(1950, 6, 15);

        let before_birthday = snapshot(dob, "2024-06-14 23:59:00");
        assert_eq!(before_birthday.age_at_latest_test(), Some(73));

        let on_birthday = snapshot(dob, "2024-06-15 00:00:00");
        assert_eq!(on_birthday.age_at_latest_test(), Some(74));
    }

    #[test]
    fn test_age_unknown_without_dob() {
        assert_eq!(snapshot(None, "2024-01-01 00:00:00").age_at_latest_test(), None);
    }

    #[test]
    fn test_sex_codes() {
        assert_eq!(Sex::from_code("m"), Some(Sex::Male));
        assert_eq!(Sex::from_code("F"), Some(Sex::Female));
        assert_eq!(Sex::from_code("U"), None);
        assert_eq!(Sex::from_code(""), None);
        assert_eq!(Sex::Female.encoded(), 1.0);
    }
}
