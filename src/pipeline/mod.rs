//! # Clinical message pipeline
//!
//! Everything that happens to a frame after the transport hands it over:
//!
//! 1. `hl7` parses the payload into a `ClinicalEvent`
//! 2. `db` folds admissions and creatinine results into the patient store
//! 3. `evaluator` scores the fresh snapshot with one of two `model`s
//! 4. `pager` delivers an alert for each newly positive patient
//!
//! `engine` sequences these per message. `seed` pre-loads historical
//! results into a new store before streaming starts. `metrics` names the
//! operator counters and histograms recorded along the way.
//!
//! ## Guarantees
//!
//! - A lab result is durable before its frame is acknowledged
//! - A patient is paged at most once, across restarts
//! - Paging never delays the next acknowledgement

pub mod types;
pub mod errors;
pub mod hl7;
pub mod db;
pub mod seed;
pub mod features;
pub mod model;
pub mod evaluator;
pub mod pager;
pub mod engine;
pub mod metrics;

// Re-export commonly used types
pub use types::{ClinicalEvent, Mrn, PatientSnapshot, RiskDecision, Sex};
pub use errors::{AlertDeliveryError, EngineError, EvaluationError, ParseError, StorageError};
pub use db::PatientStore;
pub use evaluator::RiskEvaluator;
pub use pager::{AlertDispatcher, HttpPager, PageRequest, Pager, RetryPolicy};
pub use engine::{MessageEngine, Outcome};
