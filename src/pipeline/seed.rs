//! Historical seed loader
//!
//! Reads the hospital history file (`mrn,date,result,date,result,...` with a
//! header row) into the patient store before the stream starts. Only runs
//! until a load has committed, so a restart never double-counts history
//! and a failed load is retried on the next start.

use super::db::{HistoryRecord, PatientStore, DATETIME_FORMAT};
use super::errors::StorageError;
use super::hl7::{MAX_RESULT, MIN_RESULT};
use chrono::{NaiveDate, NaiveDateTime};
use std::path::Path;

/// Parse one history row. Returns None if the MRN is unusable; malformed
/// date/result pairs are skipped individually.
pub fn parse_history_line(line: &str) -> Option<HistoryRecord> {
    let mut cells = line.split(',').map(str::trim);
    let mrn = cells.next()?.parse().ok()?;

    let rest: Vec<&str> = cells.collect();
    let tests = rest
        .chunks(2)
        .filter_map(|pair| match pair {
            [date, result] => {
                let date = parse_history_date(date)?;
                let result: f64 = result.parse().ok()?;
                if !result.is_finite() {
                    return None;
                }
                Some((date, result.clamp(MIN_RESULT, MAX_RESULT)))
            }
            _ => None,
        })
        .collect();

    Some(HistoryRecord { mrn, tests })
}

fn parse_history_date(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Load the history file into the store. A missing file is not an error
/// and still marks the store as seeded.
pub fn load_history(store: &PatientStore, path: impl AsRef<Path>) -> Result<usize, StorageError> {
    let path = path.as_ref();
    if !path.exists() {
        log::warn!("History file not found: {} (starting with empty store)", path.display());
        return store.insert_history(&[]);
    }

    let content = std::fs::read_to_string(path)?;
    let mut skipped = 0usize;
    let records: Vec<HistoryRecord> = content
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let record = parse_history_line(line);
            if record.is_none() {
                skipped += 1;
            }
            record
        })
        .collect();

    let inserted = store.insert_history(&records)?;
    log::info!(
        "Seeded {} patients / {} tests from {} ({} rows skipped)",
        records.len(),
        inserted,
        path.display(),
        skipped
    );
    Ok(inserted)
}
