//! Lock Error Types

use thiserror::Error;

/// Postgres SQLSTATE for `lock_not_available` (raised by `FOR UPDATE NOWAIT`)
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

/// Errors raised by the lock core
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// A DID, dataset or location is unknown
    #[error("Not found: {0}")]
    NotFound(String),

    /// `NoWait` acquisition hit rows held by another transaction
    #[error("Lock acquisition failed: {0}")]
    LockAcquisitionFailed(String),

    /// A row the transition assumed locked and present is missing.
    /// Indicates a concurrency-control bug.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored value could not be decoded
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl LockError {
    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        match self {
            LockError::NotFound(_) => "NOT_FOUND",
            LockError::LockAcquisitionFailed(_) => "LOCK_ACQUISITION_FAILED",
            LockError::Integrity(_) => "INTEGRITY_VIOLATION",
            LockError::InvalidArgument(_) => "INVALID_ARGUMENT",
            LockError::InvalidData(_) => "INVALID_DATA",
            LockError::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Whether the caller may retry the same outcome event later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::LockAcquisitionFailed(_) | LockError::DatabaseError(_)
        )
    }
}

impl From<sqlx::Error> for LockError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e
            && db_err.code().as_deref() == Some(PG_LOCK_NOT_AVAILABLE)
        {
            return LockError::LockAcquisitionFailed(db_err.message().to_string());
        }
        match e {
            sqlx::Error::RowNotFound => LockError::NotFound("row not found".to_string()),
            other => LockError::DatabaseError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            LockError::LockAcquisitionFailed("busy".into()).code(),
            "LOCK_ACQUISITION_FAILED"
        );
        assert_eq!(LockError::Integrity("x".into()).code(), "INTEGRITY_VIOLATION");
        assert_eq!(LockError::NotFound("mc:ds".into()).code(), "NOT_FOUND");
    }

    #[test]
    fn test_retryable() {
        assert!(LockError::LockAcquisitionFailed("busy".into()).is_retryable());
        assert!(LockError::DatabaseError("reset".into()).is_retryable());
        assert!(!LockError::Integrity("missing rule".into()).is_retryable());
        assert!(!LockError::NotFound("mc:ds".into()).is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: LockError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, LockError::NotFound(_)));
    }

    #[test]
    fn test_display() {
        let err = LockError::NotFound("mc:ds".into());
        assert_eq!(err.to_string(), "Not found: mc:ds");
    }
}
