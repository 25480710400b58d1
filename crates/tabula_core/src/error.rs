//! Storage error taxonomy and classification.
//!
//! # Responsibility
//! - Give every storage failure one stable `ErrorCode`.
//! - Keep the classified kind intact while callers add context.
//!
//! # Invariants
//! - Wrapping never changes the code of the wrapped error.
//! - A rollback failure composed with an earlier failure keeps the earlier
//!   failure's code and message.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StorageResult<T> = Result<T, StorageError>;

/// Category of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Failure that could not be categorized.
    Unknown,
    /// No matching row.
    NotFound,
    /// Unresolvable field, unsupported filter condition or malformed projection.
    InvalidArgument,
    /// Invariant violation or unexpected failure inside the storage layer.
    Internal,
    /// The execution context was cancelled.
    Canceled,
    /// The execution context deadline passed.
    DeadlineExceeded,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::NotFound => "NotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::Internal => "Internal",
            Self::Canceled => "Canceled",
            Self::DeadlineExceeded => "DeadlineExceeded",
        }
    }

    /// Classifies an arbitrary error.
    ///
    /// Storage errors report their own code, SQLite errors are mapped the
    /// same way `From<rusqlite::Error>` maps them, anything else is `Unknown`.
    pub fn of(err: &(dyn Error + 'static)) -> Self {
        if let Some(storage_err) = err.downcast_ref::<StorageError>() {
            return storage_err.code;
        }
        if let Some(sqlite_err) = err.downcast_ref::<rusqlite::Error>() {
            return sqlite_code(sqlite_err);
        }
        Self::Unknown
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified storage failure.
#[derive(Debug)]
pub struct StorageError {
    code: ErrorCode,
    message: String,
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl StorageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Typed not-found error for one entity id.
    pub fn not_found(entry_name: &str, id: i64) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("\"{entry_name}\" entry by id {id} could not be found"),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// Field name that the entity schema cannot resolve.
    pub fn invalid_search_field(field_name: &str) -> Self {
        Self::invalid_argument(format!(
            "invalid field \"{field_name}\" for search condition"
        ))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorCode::Canceled, "operation canceled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorCode::DeadlineExceeded, "operation deadline exceeded")
    }

    /// Adds caller context while keeping the classified code.
    pub fn wrap(self, context: impl Display) -> Self {
        Self {
            code: self.code,
            message: format!("{context}: {}", self.message),
            source: Some(Box::new(self)),
        }
    }

    /// Reports a rollback failure without masking the failure that caused it.
    pub fn with_rollback_failure(self, rollback_err: StorageError) -> Self {
        Self {
            code: self.code,
            message: format!(
                "transaction error: {}. something went wrong in rollback: {}",
                self.message, rollback_err.message
            ),
            source: Some(Box::new(self)),
        }
    }

    pub(crate) fn with_source(mut self, source: impl Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn Error + 'static))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        let code = sqlite_code(&value);
        let message = match code {
            ErrorCode::NotFound => "record not found".to_string(),
            ErrorCode::Canceled => "operation canceled".to_string(),
            _ => value.to_string(),
        };
        Self::new(code, message).with_source(value)
    }
}

impl From<DbError> for StorageError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => err.into(),
            other => Self::internal(other.to_string()).with_source(other),
        }
    }
}

fn sqlite_code(err: &rusqlite::Error) -> ErrorCode {
    match err {
        rusqlite::Error::QueryReturnedNoRows => ErrorCode::NotFound,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::OperationInterrupted =>
        {
            ErrorCode::Canceled
        }
        _ => ErrorCode::Unknown,
    }
}
