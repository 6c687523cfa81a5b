//! Per-message processing
//!
//! `MessageEngine::handle_frame` takes one frame payload through
//! parse → store → evaluate → mark → enqueue page, and reports what the
//! acknowledgement should say. The caller writes the ACK only after this
//! returns, so every acknowledged lab result is already durable.
//!
//! ```text
//! frame payload
//!     ↓
//! hl7::parse ──(ParseError)──→ Outcome::Rejected (AE)
//!     ↓
//! PatientStore::upsert_admission / record_test
//!     ↓ snapshot (not yet paged)
//! RiskEvaluator::evaluate
//!     ↓ positive
//! PatientStore::mark_paged ──(already paged)──→ no page
//!     ↓ transitioned
//! pager channel (try_send, never waits)
//! ```

use super::db::PatientStore;
use super::errors::{EngineError, EvaluationError, ParseError, StorageError};
use super::evaluator::RiskEvaluator;
use super::hl7::{self, AckCode};
use super::metrics::{
    ADMISSIONS, DISCHARGES, LAB_RESULTS, MESSAGES, PAGE_REQUESTS, PATIENTS_IN_HOSPITAL,
    STORAGE_ERRORS, TEST_RESULTS,
};
use super::pager::PageRequest;
use super::types::{ClinicalEvent, Mrn};
use chrono::NaiveDateTime;
use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Pause before the single retry of a transient storage failure
const STORAGE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What happened to one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Admitted { mrn: Mrn },
    /// A creatinine result was stored; `paged` is true if this message triggered a page
    ResultRecorded { mrn: Mrn, paged: bool },
    /// Non-creatinine lab result
    Discarded { mrn: Mrn },
    /// Discharge or other message type needing only an ACK
    Ignored,
    /// Payload could not be parsed; nothing was stored
    Rejected(ParseError),
}

impl Outcome {
    pub fn ack_code(&self) -> AckCode {
        match self {
            Outcome::Rejected(_) => AckCode::Error,
            _ => AckCode::Accept,
        }
    }
}

pub struct MessageEngine {
    store: PatientStore,
    evaluator: Arc<RiskEvaluator>,
    pager_tx: mpsc::Sender<PageRequest>,

    /// Clock for ACK timestamps (replaceable in tests)
    now_fn: Box<dyn Fn() -> NaiveDateTime + Send + Sync>,
}

impl MessageEngine {
    pub fn new(
        store: PatientStore,
        evaluator: Arc<RiskEvaluator>,
        pager_tx: mpsc::Sender<PageRequest>,
    ) -> Self {
        Self::new_with_clock(
            store,
            evaluator,
            pager_tx,
            Box::new(|| chrono::Local::now().naive_local()),
        )
    }

    pub fn new_with_clock(
        store: PatientStore,
        evaluator: Arc<RiskEvaluator>,
        pager_tx: mpsc::Sender<PageRequest>,
        now_fn: Box<dyn Fn() -> NaiveDateTime + Send + Sync>,
    ) -> Self {
        Self {
            store,
            evaluator,
            pager_tx,
            now_fn,
        }
    }

    pub fn store(&self) -> &PatientStore {
        &self.store
    }

    /// ACK text for `code`, stamped with the engine clock
    pub fn ack(&self, code: AckCode) -> String {
        hl7::build_ack(code, (self.now_fn)())
    }

    /// Process one frame payload.
    ///
    /// Errors mean the message must not be acknowledged: either the store
    /// failed twice or the evaluator was handed an impossible snapshot.
    pub async fn handle_frame(
        &self,
        payload: &[u8],
        received_at: Instant,
    ) -> Result<Outcome, EngineError> {
        increment_counter!(MESSAGES);
        let event = match hl7::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Rejecting message: {}", e);
                return Ok(Outcome::Rejected(e));
            }
        };

        match event {
            ClinicalEvent::Admission(admission) => {
                retry_once("upsert_admission", || {
                    self.store.upsert_admission(
                        admission.mrn,
                        admission.sex,
                        admission.date_of_birth,
                    )
                })
                .await?;
                increment_counter!(ADMISSIONS);
                increment_gauge!(PATIENTS_IN_HOSPITAL, 1.0);
                log::debug!("Admission recorded for MRN {}", admission.mrn);
                Ok(Outcome::Admitted { mrn: admission.mrn })
            }

            ClinicalEvent::LabResult(lab) => {
                increment_counter!(LAB_RESULTS);
                histogram!(TEST_RESULTS, lab.result);
                let snapshot = retry_once("record_test", || {
                    self.store.record_test(lab.mrn, lab.test_date, lab.result)
                })
                .await?;
                log::debug!(
                    "MRN {} result {} (n={}, min={}, mean={:.3})",
                    lab.mrn,
                    lab.result,
                    snapshot.test_count,
                    snapshot.min_result,
                    snapshot.mean_result
                );

                if snapshot.paged {
                    return Ok(Outcome::ResultRecorded { mrn: lab.mrn, paged: false });
                }

                let decision = match self.evaluator.evaluate(&snapshot) {
                    Ok(decision) => decision,
                    Err(EvaluationError::Model(msg)) => {
                        // The result is stored; a broken model must not stall the feed
                        log::error!("Model failed for MRN {}: {}", lab.mrn, msg);
                        return Ok(Outcome::ResultRecorded { mrn: lab.mrn, paged: false });
                    }
                    Err(e) => return Err(e.into()),
                };

                if !decision.positive {
                    return Ok(Outcome::ResultRecorded { mrn: lab.mrn, paged: false });
                }

                let transitioned = retry_once("mark_paged", || self.store.mark_paged(lab.mrn)).await?;
                if !transitioned {
                    return Ok(Outcome::ResultRecorded { mrn: lab.mrn, paged: false });
                }

                log::info!("AKI detected for MRN {}, queueing page", lab.mrn);
                self.enqueue_page(PageRequest {
                    mrn: lab.mrn,
                    test_time: Some(lab.raw_test_time),
                    received_at,
                });
                Ok(Outcome::ResultRecorded { mrn: lab.mrn, paged: true })
            }

            ClinicalEvent::Discarded { mrn, test_code } => {
                log::debug!("Ignoring {} result for MRN {}", test_code, mrn);
                Ok(Outcome::Discarded { mrn })
            }

            ClinicalEvent::DischargeOrUnhandled { message_type } => {
                if hl7::is_message_type(&message_type, "ADT", Some("A03")) {
                    increment_counter!(DISCHARGES);
                    decrement_gauge!(PATIENTS_IN_HOSPITAL, 1.0);
                }
                log::debug!("No action for {}", message_type);
                Ok(Outcome::Ignored)
            }
        }
    }

    /// Hand the page to the worker without waiting.
    ///
    /// `paged` is already set, so a page that cannot be queued is recorded
    /// as failed instead of retried later.
    fn enqueue_page(&self, request: PageRequest) {
        let mrn = request.mrn;
        increment_counter!(PAGE_REQUESTS);
        if let Err(e) = self.pager_tx.try_send(request) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "pager queue full",
                mpsc::error::TrySendError::Closed(_) => "pager worker stopped",
            };
            log::error!("Could not queue page for MRN {}: {}", mrn, reason);
            if let Err(store_err) = self.store.record_failed_alert(mrn, 0, reason) {
                log::error!("Could not record failed page for MRN {}: {}", mrn, store_err);
            }
        }
    }
}

/// Run a store operation, retrying once if the first failure is transient
async fn retry_once<T, F>(op: &str, mut f: F) -> Result<T, StorageError>
where
    F: FnMut() -> Result<T, StorageError>,
{
    match f() {
        Err(e) if e.is_transient() => {
            increment_counter!(STORAGE_ERRORS);
            log::warn!("{} failed ({}), retrying once", op, e);
            tokio::time::sleep(STORAGE_RETRY_DELAY).await;
            f().map_err(|e| {
                increment_counter!(STORAGE_ERRORS);
                log::error!("{} failed again: {}", op, e);
                e
            })
        }
        Err(e) => {
            increment_counter!(STORAGE_ERRORS);
            log::error!("{} failed: {}", op, e);
            Err(e)
        }
        ok => ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::evaluator::tests::ratio_evaluator;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn admission(mrn: Mrn, sex: &str, dob: &str) -> Vec<u8> {
        format!(
            "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||20240101100000||ADT^A01|||2.5\rPID|1||{}||DOE^JANE||{}|{}",
            mrn, dob, sex
        )
        .into_bytes()
    }

    fn lab(mrn: Mrn, time: &str, result: f64) -> Vec<u8> {
        format!(
            "MSH|^~\\&|SIMULATION|SOUTH RIVERSIDE|||{}||ORU^R01|||2.5\rPID|1||{}\rOBR|1||||||{}\rOBX|1|SN|CREATININE||{}",
            time, mrn, time, result
        )
        .into_bytes()
    }

    fn setup(ratio: f64) -> (TempDir, MessageEngine, mpsc::Receiver<PageRequest>) {
        let dir = tempfile::tempdir().unwrap();
        let store = PatientStore::open(dir.path().join("patients.db")).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let engine = MessageEngine::new(store, Arc::new(ratio_evaluator(ratio)), tx);
        (dir, engine, rx)
    }

    #[tokio::test]
    async fn test_admission_then_results_pages_once() {
        let (_dir, engine, mut rx) = setup(1.1);
        let now = Instant::now();

        let outcome = engine.handle_frame(&admission(100, "F", "19500101"), now).await.unwrap();
        assert_eq!(outcome, Outcome::Admitted { mrn: 100 });

        let first = engine.handle_frame(&lab(100, "20240101120000", 1.0), now).await.unwrap();
        assert_eq!(first, Outcome::ResultRecorded { mrn: 100, paged: false });
        let second = engine.handle_frame(&lab(100, "20240102120000", 1.2), now).await.unwrap();
        assert_eq!(second, Outcome::ResultRecorded { mrn: 100, paged: true });
        // Already paged: stored but not evaluated
        let third = engine.handle_frame(&lab(100, "20240103120000", 0.9), now).await.unwrap();
        assert_eq!(third, Outcome::ResultRecorded { mrn: 100, paged: false });
        let fourth = engine.handle_frame(&lab(100, "20240104120000", 3.0), now).await.unwrap();
        assert_eq!(fourth, Outcome::ResultRecorded { mrn: 100, paged: false });

        let page = rx.try_recv().unwrap();
        assert_eq!(page.mrn, 100);
        assert_eq!(page.body(), "100,20240102120000");
        assert!(rx.try_recv().is_err());

        let record = engine.store().patient(100).unwrap().unwrap();
        assert!(record.paged);
        assert_eq!(record.test_count, 4);
        assert_eq!(record.date_of_birth, NaiveDate::from_ymd_opt(1950, 1, 1));
    }

    #[tokio::test]
    async fn test_aggregates_after_three_results() {
        // Never positive: exercise aggregation alone
        let (_dir, engine, mut rx) = setup(100.0);
        let now = Instant::now();

        engine.handle_frame(&admission(100, "F", "19500101"), now).await.unwrap();
        for (time, result) in [("20240101120000", 1.0), ("20240102120000", 1.2), ("20240103120000", 0.9)] {
            engine.handle_frame(&lab(100, time, result), now).await.unwrap();
        }

        let record = engine.store().patient(100).unwrap().unwrap();
        assert_eq!(record.test_count, 3);
        assert_eq!(record.min_result, Some(0.9));
        assert!((record.mean_result - 3.1 / 3.0).abs() < 1e-9);
        assert!(!record.paged);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lab_before_admission_creates_patient() {
        let (_dir, engine, _rx) = setup(100.0);
        let outcome = engine
            .handle_frame(&lab(42, "20240101120000", 88.0), Instant::now())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::ResultRecorded { mrn: 42, paged: false });

        let record = engine.store().patient(42).unwrap().unwrap();
        assert_eq!(record.sex, None);
        assert_eq!(record.test_count, 1);
    }

    #[tokio::test]
    async fn test_parse_error_rejected_without_store_change() {
        let (_dir, engine, _rx) = setup(1.1);
        let payload = b"MSH|^~\\&|SIM|SR|||20240101||ORU^R01|||2.5\rOBR|1||||||20240101120000\rOBX|1|SN|CREATININE||1.0";

        let outcome = engine.handle_frame(payload, Instant::now()).await.unwrap();
        assert_eq!(outcome.ack_code(), AckCode::Error);
        assert!(matches!(outcome, Outcome::Rejected(ParseError::MissingField("PID-3"))));
    }

    #[tokio::test]
    async fn test_non_creatinine_and_discharge_acknowledged() {
        let (_dir, engine, _rx) = setup(1.1);
        let potassium = b"MSH|^~\\&|SIM|SR|||20240101120000||ORU^R01|||2.5\rPID|1||7\rOBR|1||||||20240101120000\rOBX|1|SN|POTASSIUM||4.1";
        let discharge = b"MSH|^~\\&|SIM|SR|||20240101120000||ADT^A03|||2.5\rPID|1||7";

        let outcome = engine.handle_frame(potassium, Instant::now()).await.unwrap();
        assert_eq!(outcome, Outcome::Discarded { mrn: 7 });
        assert_eq!(outcome.ack_code(), AckCode::Accept);

        let outcome = engine.handle_frame(discharge, Instant::now()).await.unwrap();
        assert_eq!(outcome, Outcome::Ignored);
        assert!(engine.store().patient(7).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counts_messages_by_kind() {
        use crate::pipeline::metrics::testing::counter;

        let names = [MESSAGES, ADMISSIONS, DISCHARGES, LAB_RESULTS, PAGE_REQUESTS];
        let before: Vec<u64> = names.iter().map(|n| counter(n)).collect();

        let (_dir, engine, _rx) = setup(1.1);
        let now = Instant::now();
        let discharge = b"MSH|^~\\&|SIM|SR|||20240105120000||ADT^A03|||2.5\rPID|1||31";
        engine.handle_frame(&admission(31, "M", "19700101"), now).await.unwrap();
        engine.handle_frame(&lab(31, "20240101120000", 1.0), now).await.unwrap();
        engine.handle_frame(&lab(31, "20240102120000", 2.0), now).await.unwrap();
        engine.handle_frame(discharge, now).await.unwrap();

        let delta: Vec<u64> = names
            .iter()
            .zip(&before)
            .map(|(n, b)| counter(n) - b)
            .collect();
        // Other tests share the recorder, so only lower bounds hold
        assert!(delta[0] >= 4, "messages: {:?}", delta);
        assert!(delta[1] >= 1, "admissions: {:?}", delta);
        assert!(delta[2] >= 1, "discharges: {:?}", delta);
        assert!(delta[3] >= 2, "lab results: {:?}", delta);
        assert!(delta[4] >= 1, "page requests: {:?}", delta);
    }

    #[tokio::test]
    async fn test_closed_pager_queue_records_failure() {
        let (_dir, engine, rx) = setup(1.1);
        drop(rx);
        let now = Instant::now();

        engine.handle_frame(&lab(9, "20240101120000", 1.0), now).await.unwrap();
        let outcome = engine.handle_frame(&lab(9, "20240102120000", 2.0), now).await.unwrap();

        assert_eq!(outcome, Outcome::ResultRecorded { mrn: 9, paged: true });
        assert!(engine.store().patient(9).unwrap().unwrap().paged);
        assert_eq!(engine.store().failed_alerts(9).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ack_uses_engine_clock() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatientStore::open(dir.path().join("p.db")).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let fixed = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(13, 53, 0)
            .unwrap();
        let engine = MessageEngine::new_with_clock(
            store,
            Arc::new(ratio_evaluator(1.1)),
            tx,
            Box::new(move || fixed),
        );

        assert_eq!(
            engine.ack(AckCode::Accept),
            "MSH|^~\\&|||||20240102135300||ACK|||2.5\rMSA|AA"
        );
    }

    #[tokio::test]
    async fn test_retry_once_only_for_transient() {
        use rusqlite::ffi::{Error as FfiError, SQLITE_BUSY, SQLITE_FULL};
        use std::cell::Cell;

        let calls = Cell::new(0);
        let result: Result<(), StorageError> = retry_once("busy", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(StorageError::Database(rusqlite::Error::SqliteFailure(
                    FfiError::new(SQLITE_BUSY),
                    None,
                )))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.get(), 2);

        calls.set(0);
        let result: Result<(), StorageError> = retry_once("full", || {
            calls.set(calls.get() + 1);
            Err(StorageError::Database(rusqlite::Error::SqliteFailure(
                FfiError::new(SQLITE_FULL),
                None,
            )))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
