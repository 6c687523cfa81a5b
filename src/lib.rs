//! Acute kidney injury monitor: consumes an HL7 feed over MLLP, keeps
//! per-patient creatinine statistics, and pages the response team when
//! the risk model flags a patient.

pub mod pipeline;
pub mod stream_core;
