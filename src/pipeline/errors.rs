//! Error taxonomy for the message pipeline
//!
//! Transport and parse errors are recoverable inside the stream loop.
//! Storage errors are retried once and then halt the stream.
//! Alert delivery errors are recorded and logged but never halt anything.

/// Failure to turn a frame payload into a clinical event
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Structure is not a recognisable HL7 message
    Malformed(String),
    /// A required field (e.g. PID-3) is absent or empty
    MissingField(&'static str),
    /// A field is present but does not parse (e.g. non-numeric OBX-5)
    InvalidValue { field: &'static str, value: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Malformed(msg) => write!(f, "Malformed message: {}", msg),
            ParseError::MissingField(field) => write!(f, "Missing required field: {}", field),
            ParseError::InvalidValue { field, value } => {
                write!(f, "Invalid value for {}: {:?}", field, value)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Patient store failure
#[derive(Debug)]
pub enum StorageError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    /// Store mutex was poisoned by a panicking writer
    Poisoned,
}

impl StorageError {
    /// Busy/locked databases are worth one more attempt; everything else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "Database error: {}", e),
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Poisoned => write!(f, "Patient store lock poisoned"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Risk evaluation failure
#[derive(Debug)]
pub enum EvaluationError {
    /// Snapshot has no recorded tests
    Precondition(String),
    /// Model artifact could not be loaded or does not fit the feature vector
    Model(String),
}

impl std::fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationError::Precondition(msg) => write!(f, "Precondition violated: {}", msg),
            EvaluationError::Model(msg) => write!(f, "Model error: {}", msg),
        }
    }
}

impl std::error::Error for EvaluationError {}

/// Page could not be delivered after every attempt
#[derive(Debug)]
pub struct AlertDeliveryError {
    pub mrn: i64,
    pub attempts: u32,
    pub last_error: String,
}

impl std::fmt::Display for AlertDeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Page for MRN {} failed after {} attempts: {}",
            self.mrn, self.attempts, self.last_error
        )
    }
}

impl std::error::Error for AlertDeliveryError {}

/// Errors that stop the stream
#[derive(Debug)]
pub enum EngineError {
    Storage(StorageError),
    Evaluation(EvaluationError),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Storage(err)
    }
}

impl From<EvaluationError> for EngineError {
    fn from(err: EvaluationError) -> Self {
        EngineError::Evaluation(err)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Storage(e) => write!(f, "Storage failure: {}", e),
            EngineError::Evaluation(e) => write!(f, "Evaluation failure: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let busy = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());

        let full = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        ));
        assert!(!full.is_transient());
        assert!(!StorageError::Poisoned.is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = ParseError::MissingField("PID-3");
        assert_eq!(err.to_string(), "Missing required field: PID-3");

        let err = AlertDeliveryError {
            mrn: 100,
            attempts: 3,
            last_error: "503".to_string(),
        };
        assert_eq!(err.to_string(), "Page for MRN 100 failed after 3 attempts: 503");
    }
}
