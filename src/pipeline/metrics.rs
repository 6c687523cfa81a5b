//! Operator metrics
//!
//! Recorded through the `metrics` facade. The binary installs a Prometheus
//! recorder and flushes its rendering to the log on an interval; without a
//! recorder every call here is a no-op.
//!
//! | Metric | Kind | Recorded by |
//! |---|---|---|
//! | `hl7_messages` | counter | engine, per well-formed frame |
//! | `admissions` / `discharges` / `lab_results` | counter | engine |
//! | `patients_in_hospital` | gauge | engine (admission +1, discharge -1) |
//! | `test_results` | histogram | engine, creatinine value |
//! | `page_requests` | counter | engine, page queued |
//! | `page_response_not_2xx` | counter | pager, per rejected attempt |
//! | `page_failed` | counter | pager, delivery given up |
//! | `storage_errors` | counter | engine, per failed store call |
//! | `malformed_frames` | counter | stream loop |
//! | `connection_closed` | counter | stream loop |
//! | `request_latency_seconds` | histogram | stream loop, receipt to ACK |

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

pub const MESSAGES: &str = "hl7_messages";
pub const ADMISSIONS: &str = "admissions";
pub const DISCHARGES: &str = "discharges";
pub const LAB_RESULTS: &str = "lab_results";
pub const PATIENTS_IN_HOSPITAL: &str = "patients_in_hospital";
pub const TEST_RESULTS: &str = "test_results";
pub const PAGE_REQUESTS: &str = "page_requests";
pub const PAGE_RESPONSE_NOT_2XX: &str = "page_response_not_2xx";
pub const PAGE_FAILED: &str = "page_failed";
pub const STORAGE_ERRORS: &str = "storage_errors";
pub const MALFORMED_FRAMES: &str = "malformed_frames";
pub const CONNECTION_CLOSED: &str = "connection_closed";
pub const REQUEST_LATENCY: &str = "request_latency_seconds";

/// Up to the 3 s latency budget
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.015, 0.02, 0.025, 0.03, 0.035, 0.04, 0.045, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0,
    2.0, 3.0,
];

pub const TEST_RESULT_BUCKETS: &[f64] = &[
    50.0, 75.0, 100.0, 125.0, 150.0, 173.0, 200.0, 225.0, 250.0, 275.0, 300.0,
];

/// Register descriptions with the installed recorder
pub fn describe() {
    describe_counter!(MESSAGES, "Number of HL7 messages received");
    describe_counter!(ADMISSIONS, "Number of admissions");
    describe_counter!(DISCHARGES, "Number of discharges");
    describe_counter!(LAB_RESULTS, "Number of creatinine results");
    describe_gauge!(PATIENTS_IN_HOSPITAL, "Number of patients in the hospital");
    describe_histogram!(TEST_RESULTS, "Creatinine results");
    describe_counter!(PAGE_REQUESTS, "Number of page requests issued");
    describe_counter!(
        PAGE_RESPONSE_NOT_2XX,
        "Number of page attempts answered with a non-2xx status"
    );
    describe_counter!(PAGE_FAILED, "Number of pages abandoned after all attempts");
    describe_counter!(STORAGE_ERRORS, "Number of failed patient store operations");
    describe_counter!(MALFORMED_FRAMES, "Number of malformed MLLP frames");
    describe_counter!(CONNECTION_CLOSED, "Number of MLLP connections closed");
    describe_histogram!(
        REQUEST_LATENCY,
        Unit::Seconds,
        "Time from frame receipt to acknowledgement"
    );
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted_and_cover_budget() {
        for buckets in [LATENCY_BUCKETS, TEST_RESULT_BUCKETS] {
            assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(LATENCY_BUCKETS.last(), Some(&3.0));
    }

    #[test]
    fn test_counter_reads_recorded_increments() {
        describe();
        let before = testing::counter(CONNECTION_CLOSED);
        metrics::increment_counter!(CONNECTION_CLOSED);
        metrics::counter!(CONNECTION_CLOSED, 2);
        assert!(testing::counter(CONNECTION_CLOSED) >= before + 3);
    }
}
