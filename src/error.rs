use thiserror::Error;

use crate::session::ConnectionState;

/// Failures establishing or keeping the broker session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("broker rejected the supplied credentials")]
    AuthRejected,
    #[error("broker unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("timed out waiting for the broker")]
    Timeout,
    #[error("broker refused the connection: {0}")]
    Refused(String),
    #[error("broker session lost after {attempts} reconnect attempts")]
    SessionLost { attempts: usize },
}

impl ConnectionError {
    /// Credential problems do not improve with another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::AuthRejected)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("broker session is {state}")]
    NotConnected {
        state: ConnectionState,
        #[source]
        cause: Option<ConnectionError>,
    },
    #[error("broker rejected the publish: {0}")]
    BrokerRejected(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("required field '{0}' is missing")]
    MissingField(String),
    #[error("field '{field}' must be {expected}")]
    InvalidType {
        field: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not obtain a database connection: {0}")]
    ConnectionRefused(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("database timed out: {0}")]
    Timeout(String),
    #[error("database error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => StorageError::ConstraintViolation(err.to_string()),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StorageError::Timeout(err.to_string())
            }
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::PermissionDenied) => {
                StorageError::ConnectionRefused(err.to_string())
            }
            _ => StorageError::Backend(err.to_string()),
        }
    }
}

/// r2d2 only fails a checkout once `connection_timeout` has elapsed.
impl From<r2d2::Error> for StorageError {
    fn from(err: r2d2::Error) -> Self {
        StorageError::Timeout(err.to_string())
    }
}

/// Everything that can stop a command on its way to the broker.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Per-message failures on the telemetry path. None of them end the subscription.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsumeError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_codes_map_to_storage_kinds() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StorageError::from(busy), StorageError::Timeout(_)));

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("NOT NULL constraint failed".to_string()),
        );
        assert!(matches!(
            StorageError::from(constraint),
            StorageError::ConstraintViolation(_)
        ));

        let cannot_open = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
            None,
        );
        assert!(matches!(
            StorageError::from(cannot_open),
            StorageError::ConnectionRefused(_)
        ));

        assert!(matches!(
            StorageError::from(rusqlite::Error::QueryReturnedNoRows),
            StorageError::Backend(_)
        ));
    }

    #[test]
    fn only_auth_rejection_is_final() {
        assert!(!ConnectionError::AuthRejected.is_retryable());
        assert!(ConnectionError::Timeout.is_retryable());
        assert!(ConnectionError::NetworkUnreachable("refused".into()).is_retryable());
    }
}
