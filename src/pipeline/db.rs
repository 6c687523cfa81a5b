//! Patient store backed by SQLite
//!
//! Owns the `patients` and `blood_tests` tables. Every public operation runs
//! in its own IMMEDIATE transaction behind a process-wide mutex, so a reader
//! never sees a test row without the matching aggregate update.
//!
//! Tables:
//! - `patients` - one row per MRN, demographics + running aggregates + paged flag
//! - `blood_tests` - append-only creatinine results
//! - `failed_alerts` - pages that could not be delivered
//! - `store_meta` - one-off markers, e.g. that the history seed committed

use super::errors::StorageError;
use super::types::{Mrn, PatientSnapshot, Sex};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS patients (
    mrn             INTEGER PRIMARY KEY,
    sex             TEXT,
    dob             TEXT,
    paged           INTEGER NOT NULL DEFAULT 0,
    min_result      REAL,
    mean_result     REAL NOT NULL DEFAULT 0,
    test_count      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS blood_tests (
    test_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    mrn             INTEGER NOT NULL REFERENCES patients(mrn),
    test_date       TEXT NOT NULL,
    result          REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_blood_tests_mrn ON blood_tests(mrn);

CREATE TABLE IF NOT EXISTS failed_alerts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    mrn             INTEGER NOT NULL,
    attempts        INTEGER NOT NULL,
    last_error      TEXT NOT NULL,
    failed_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS store_meta (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL
);
"#;

const HISTORY_SEEDED_KEY: &str = "history_seeded";

/// Stored patient row
#[derive(Debug, Clone, PartialEq)]
pub struct PatientRecord {
    pub mrn: Mrn,
    pub sex: Option<Sex>,
    pub date_of_birth: Option<NaiveDate>,
    pub paged: bool,
    pub min_result: Option<f64>,
    pub mean_result: f64,
    pub test_count: i64,
}

/// One patient's history as loaded from the seed file
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub mrn: Mrn,
    pub tests: Vec<(NaiveDateTime, f64)>,
}

/// Handle to the durable patient store. Cheap to clone.
#[derive(Clone)]
pub struct PatientStore {
    conn: Arc<Mutex<Connection>>,
}

impl PatientStore {
    /// Open (or create) the store at `db_path` and apply the schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let created = !db_path.exists();

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // FULL: an acknowledged message must survive power loss
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(500))?;
        conn.execute_batch(SCHEMA)?;

        log::info!(
            "Patient store opened at {} ({})",
            db_path.display(),
            if created { "new" } else { "existing" }
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// True once a history load has committed against this store
    pub fn history_seeded(&self) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let seeded = conn
            .query_row(
                "SELECT 1 FROM store_meta WHERE key = ?1",
                params![HISTORY_SEEDED_KEY],
                |_| Ok(()),
            )
            .optional()?;
        Ok(seeded.is_some())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Register or update demographics. Aggregates and `paged` are untouched.
    pub fn upsert_admission(
        &self,
        mrn: Mrn,
        sex: Option<Sex>,
        date_of_birth: Option<NaiveDate>,
    ) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        upsert_patient(&tx, mrn, Some((sex, date_of_birth)))?;
        tx.commit()?;
        Ok(())
    }

    /// Append a test result and fold it into the patient's aggregates.
    ///
    /// Creates the patient with unknown demographics if the MRN is new.
    /// The returned snapshot reflects the write that was just committed.
    pub fn record_test(
        &self,
        mrn: Mrn,
        test_date: NaiveDateTime,
        result: f64,
    ) -> Result<PatientSnapshot, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        upsert_patient(&tx, mrn, None)?;

        tx.execute(
            "INSERT INTO blood_tests (mrn, test_date, result) VALUES (?1, ?2, ?3)",
            params![mrn, test_date.format(DATETIME_FORMAT).to_string(), result],
        )?;

        let current = read_patient(&tx, mrn)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;

        let test_count = current.test_count + 1;
        let min_result = match current.min_result {
            Some(min) if current.test_count > 0 => min.min(result),
            _ => result,
        };
        let mean_result = current.mean_result + (result - current.mean_result) / test_count as f64;

        tx.execute(
            "UPDATE patients SET min_result = ?1, mean_result = ?2, test_count = ?3 WHERE mrn = ?4",
            params![min_result, mean_result, test_count, mrn],
        )?;

        tx.commit()?;

        Ok(PatientSnapshot {
            mrn,
            sex: current.sex,
            date_of_birth: current.date_of_birth,
            paged: current.paged,
            min_result,
            mean_result,
            test_count,
            latest_result: result,
            latest_test_date: test_date,
        })
    }

    /// Set `paged` if it is not already set.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn mark_paged(&self, mrn: Mrn) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE patients SET paged = 1 WHERE mrn = ?1 AND paged = 0",
            params![mrn],
        )?;
        Ok(changed == 1)
    }

    /// Keep an undeliverable page visible for operators
    pub fn record_failed_alert(
        &self,
        mrn: Mrn,
        attempts: u32,
        last_error: &str,
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO failed_alerts (mrn, attempts, last_error, failed_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                mrn,
                attempts,
                last_error,
                chrono::Utc::now().naive_utc().format(DATETIME_FORMAT).to_string()
            ],
        )?;
        Ok(())
    }

    pub fn failed_alerts(&self, mrn: Mrn) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM failed_alerts WHERE mrn = ?1",
            params![mrn],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn patient(&self, mrn: Mrn) -> Result<Option<PatientRecord>, StorageError> {
        let conn = self.lock()?;
        Ok(read_patient(&conn, mrn)?)
    }

    /// Number of stored test rows for a patient
    pub fn test_rows(&self, mrn: Mrn) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM blood_tests WHERE mrn = ?1",
            params![mrn],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Bulk-load historical results in a single transaction.
    ///
    /// Aggregates are recomputed from the stored rows of each patient, so
    /// loading into a non-empty store still leaves them consistent. The
    /// seeded marker commits with the rows; a failed load leaves neither.
    pub fn insert_history(&self, records: &[HistoryRecord]) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0;

        {
            let mut insert = tx.prepare(
                "INSERT INTO blood_tests (mrn, test_date, result) VALUES (?1, ?2, ?3)",
            )?;
            let mut summarise = tx.prepare(
                r#"
                UPDATE patients SET
                    min_result  = (SELECT MIN(result) FROM blood_tests WHERE mrn = ?1),
                    mean_result = COALESCE((SELECT AVG(result) FROM blood_tests WHERE mrn = ?1), 0),
                    test_count  = (SELECT COUNT(*) FROM blood_tests WHERE mrn = ?1)
                WHERE mrn = ?1
                "#,
            )?;

            for record in records {
                upsert_patient(&tx, record.mrn, None)?;
                for (date, result) in &record.tests {
                    insert.execute(params![
                        record.mrn,
                        date.format(DATETIME_FORMAT).to_string(),
                        result
                    ])?;
                    inserted += 1;
                }
                summarise.execute(params![record.mrn])?;
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
            params![
                HISTORY_SEEDED_KEY,
                chrono::Utc::now().naive_utc().format(DATETIME_FORMAT).to_string()
            ],
        )?;
        tx.commit()?;
        Ok(inserted)
    }
}

/// Create the patient row if missing. With `Some(demographics)` the
/// demographic columns are overwritten; with `None` an existing row is left alone.
fn upsert_patient(
    tx: &Transaction<'_>,
    mrn: Mrn,
    demographics: Option<(Option<Sex>, Option<NaiveDate>)>,
) -> Result<(), rusqlite::Error> {
    match demographics {
        Some((sex, dob)) => {
            tx.execute(
                r#"
                INSERT INTO patients (mrn, sex, dob) VALUES (?1, ?2, ?3)
                ON CONFLICT(mrn) DO UPDATE SET
                    sex = excluded.sex,
                    dob = excluded.dob
                "#,
                params![
                    mrn,
                    sex.map(|s| s.code()),
                    dob.map(|d| d.format(DATE_FORMAT).to_string())
                ],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO patients (mrn) VALUES (?1) ON CONFLICT(mrn) DO NOTHING",
                params![mrn],
            )?;
        }
    }
    Ok(())
}

fn read_patient(conn: &Connection, mrn: Mrn) -> Result<Option<PatientRecord>, rusqlite::Error> {
    conn.query_row(
        "SELECT mrn, sex, dob, paged, min_result, mean_result, test_count FROM patients WHERE mrn = ?1",
        params![mrn],
        |row| {
            let sex: Option<String> = row.get(1)?;
            let dob: Option<String> = row.get(2)?;
            Ok(PatientRecord {
                mrn: row.get(0)?,
                sex: sex.as_deref().and_then(Sex::from_code),
                date_of_birth: dob
                    .as_deref()
                    .and_then(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok()),
                paged: row.get::<_, i64>(3)? != 0,
                min_result: row.get(4)?,
                mean_result: row.get(5)?,
                test_count: row.get(6)?,
            })
        },
    )
    .optional()
}
