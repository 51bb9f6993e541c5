//! Error types for the docsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Resolution errors
// ---------------------------------------------------------------------------

/// Terminal, per-document failures of a conflict resolution.
///
/// These are carried inside replication events, so the type is `Clone` and
/// holds only owned strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// The resolver failed, or produced content that may not be written
    /// (a document or blob from a foreign store).
    #[error("unexpected error: {0}")]
    UnexpectedError(String),

    /// The document disappeared (was purged) while it was being resolved.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The local store was closed before the resolution could be committed.
    #[error("store is closed")]
    StoreClosed,

    /// The document kept changing underneath the resolver.
    #[error("gave up resolving '{document_id}' after {attempts} attempts")]
    RetriesExhausted { document_id: String, attempts: u32 },

    /// The dispatcher was stopped before the conflict was accepted.
    #[error("dispatcher is stopped")]
    DispatcherStopped,
}

impl ResolutionError {
    /// Short, stable name of the error kind (used in logs).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnexpectedError(_) => "unexpected_error",
            Self::NotFound(_) => "not_found",
            Self::StoreClosed => "store_closed",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::DispatcherStopped => "dispatcher_stopped",
        }
    }
}

impl From<StoreError> for ResolutionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => Self::StoreClosed,
            other => Self::UnexpectedError(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the revision store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying rusqlite error.
    #[error("store database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// A document body or blob map could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A migration failed.
    #[error("store migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A blob referenced by a revision is missing.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Generic I/O error (e.g. file permissions).
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ResolutionError::NotFound("doc1".into());
        assert_eq!(err.to_string(), "document not found: doc1");

        let err = ResolutionError::RetriesExhausted {
            document_id: "doc1".into(),
            attempts: 5,
        };
        assert_eq!(err.to_string(), "gave up resolving 'doc1' after 5 attempts");

        let err = ConfigError::InvalidValue {
            field: "resolution.max_attempts".into(),
            detail: "must be > 0".into(),
        };
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_store_closed_maps_to_resolution_error() {
        let err: ResolutionError = StoreError::Closed.into();
        assert_eq!(err, ResolutionError::StoreClosed);

        let err: ResolutionError = StoreError::BlobNotFound("abc".into()).into();
        assert!(matches!(err, ResolutionError::UnexpectedError(ref m) if m.contains("abc")));
        assert_eq!(err.kind(), "unexpected_error");
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core_err: CoreError = StoreError::Closed.into();
        assert!(matches!(core_err, CoreError::Store(_)));

        let core_err: CoreError = ResolutionError::StoreClosed.into();
        assert!(matches!(core_err, CoreError::Resolution(_)));
    }
}
