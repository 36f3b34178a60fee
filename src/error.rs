//! Error types for dump listing and project loading.

use serde::Serialize;
use std::path::PathBuf;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input errors, raised before any staging work
    InvalidDump,
    ValidationError,

    // Staging errors
    SchemaCreationFailed,
    ImportFailed,

    // Per-root errors
    AmbiguousLocalMatch,

    // Internal errors
    DatabaseError,
    InternalError,
}

/// Failure of a `list`, `load` or `cleanup` call.
///
/// Only errors that stop the whole call surface here. Per-root problems are
/// recorded on the report instead.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("invalid dump file {}: {reason}", path.display())]
    InvalidDump { path: PathBuf, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("could not create staging schema {schema}: {reason}")]
    SchemaCreationFailed { schema: String, reason: String },

    #[error("dump import into {schema} failed: {reason}")]
    ImportFailed { schema: String, reason: String },

    #[error("{count} local projects named '{name}' match; pass an explicit local id")]
    AmbiguousLocalMatch { name: String, count: usize },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LoadError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LoadError::InvalidDump { .. } => ErrorCode::InvalidDump,
            LoadError::Validation(_) => ErrorCode::ValidationError,
            LoadError::SchemaCreationFailed { .. } => ErrorCode::SchemaCreationFailed,
            LoadError::ImportFailed { .. } => ErrorCode::ImportFailed,
            LoadError::AmbiguousLocalMatch { .. } => ErrorCode::AmbiguousLocalMatch,
            LoadError::Database(_) => ErrorCode::DatabaseError,
            LoadError::Internal(_) => ErrorCode::InternalError,
        }
    }

    // Convenience constructors

    pub fn invalid_dump(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        LoadError::InvalidDump {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        LoadError::Validation(reason.into())
    }

    pub fn import_failed(schema: &str, err: impl std::fmt::Display) -> Self {
        LoadError::ImportFailed {
            schema: schema.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn schema_creation(schema: &str, err: impl std::fmt::Display) -> Self {
        LoadError::SchemaCreationFailed {
            schema: schema.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result type for loader operations.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_variants() {
        assert_eq!(
            LoadError::invalid_dump("/tmp/x.txt", "bad extension").code(),
            ErrorCode::InvalidDump
        );
        assert_eq!(
            LoadError::validation("no roots").code(),
            ErrorCode::ValidationError
        );
        assert_eq!(
            LoadError::import_failed("s", "syntax error").code(),
            ErrorCode::ImportFailed
        );
    }

    #[test]
    fn test_messages_name_the_subject() {
        let err = LoadError::AmbiguousLocalMatch {
            name: "Alpha".to_string(),
            count: 2,
        };
        assert!(err.to_string().contains("'Alpha'"));

        let err = LoadError::invalid_dump("/tmp/dump.csv", "unsupported extension");
        assert!(err.to_string().contains("/tmp/dump.csv"));
    }

    #[test]
    fn test_anyhow_converts_to_internal() {
        let err: LoadError = anyhow::anyhow!("boom").into();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.to_string(), "boom");
    }
}
