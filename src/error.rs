use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Application error taxonomy.
///
/// Variants map onto the failure classes surfaced to operators: resolve
/// failures, idempotence conflicts, consistency violations, and plain I/O.
/// A degraded success is not an error and is reported through
/// [`crate::deletion::DeletionReport`] instead.
#[derive(Error, Debug, Diagnostic)]
pub enum AppError {
    #[error("IO error: {0}")]
    #[diagnostic(code(relforge::io_error))]
    Io(#[from] std::io::Error),

    #[error("IO error: {message}")]
    #[diagnostic(code(relforge::io_error_detailed))]
    IoDetailed {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Not found: {0}")]
    #[diagnostic(code(relforge::not_found))]
    NotFound(String),

    #[error("Conflict: {0}")]
    #[diagnostic(
        code(relforge::conflict),
        help("The operation was aborted; no partial state was written")
    )]
    Conflict(String),

    #[error("Consistency violation: {0}")]
    #[diagnostic(
        code(relforge::consistency_violation),
        help("The relational record and the filesystem disagree; investigate before retrying")
    )]
    Consistency(String),

    #[error("Validation error: {0}")]
    #[diagnostic(code(relforge::validation_error))]
    Validation(String),

    #[error("Database error: {0}")]
    #[diagnostic(
        code(relforge::database_error),
        help("Check database connection and schema integrity")
    )]
    Database(String),

    #[error("Archive error: {message}")]
    #[diagnostic(code(relforge::archive_error))]
    Archive {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Import error: {0}")]
    #[diagnostic(code(relforge::import_error))]
    Import(String),

    #[error("Task error: {0}")]
    #[diagnostic(code(relforge::task_error))]
    Task(String),

    #[error("Timeout: {0}")]
    #[diagnostic(code(relforge::timeout_error))]
    Timeout(String),
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AppError::Conflict(message.into())
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        AppError::Consistency(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        AppError::Database(message.into())
    }

    pub fn io_error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        AppError::IoDetailed {
            message: message.into(),
            path,
        }
    }

    pub fn archive_error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        AppError::Archive {
            message: message.into(),
            path,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            other => AppError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Validation(format!("JSON payload error: {error}"))
    }
}

/// Unified result type for the crate.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = AppError::not_found("release apple-1.0");
        assert!(matches!(error, AppError::NotFound(_)));

        let error = AppError::conflict("sha256 file already exists");
        assert!(matches!(error, AppError::Conflict(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let app_error: AppError = io_error.into();
        assert!(matches!(app_error, AppError::Io(_)));
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let app_error: AppError = sqlx::Error::RowNotFound.into();
        assert!(matches!(app_error, AppError::NotFound(_)));
    }

    #[test]
    fn test_error_display() {
        let error = AppError::consistency("duplicate release directories in database");
        let display = format!("{}", error);
        assert!(display.contains("Consistency violation"));
        assert!(display.contains("duplicate release directories"));
    }
}
