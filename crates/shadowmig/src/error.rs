//! Error types for the migration engine.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Migration engine result type.
pub type Result<T> = std::result::Result<T, MigrateError>;

/// Migration engine errors.
///
/// Every variant that concerns a single change carries the change name so the
/// caller can report which file stopped the run.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Directory listing or file read failure
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Tracking table could not be created
    #[error("Failed to ensure tracking table: {0}")]
    Schema(#[source] sqlx::Error),

    /// Tracker read or write failed
    #[error("Query failed while {context}: {source}")]
    Query {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// The change is already recorded (unique constraint on name)
    #[error("Migration {name} is already recorded as applied: {source}")]
    Constraint {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// The change script itself failed; its transaction was rolled back
    #[error("Migration {name} failed: {source}")]
    Execute {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    /// Applied changes whose files are gone from disk
    #[error(
        "Critical: {} applied migration(s) missing from the migrations directory: {}",
        missing.len(),
        missing.join(", ")
    )]
    Integrity { missing: Vec<String> },

    /// Shadow database could not be provisioned
    #[error("Shadow database setup failed while {message}: {source}")]
    ShadowSetup {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// An already-applied change failed to replay on the shadow database
    #[error("Shadow replay of applied migration {name} failed: {source}")]
    ShadowReplay {
        name: String,
        #[source]
        source: Box<MigrateError>,
    },

    /// A pending change failed on the shadow database
    #[error("Shadow database test failed on migration {name}: {source}")]
    ShadowTest {
        name: String,
        #[source]
        source: Box<MigrateError>,
    },

    /// A single change exceeded its apply deadline
    #[error("Migration {name} timed out after {after:?}; transaction rolled back")]
    Timeout { name: String, after: Duration },

    /// The caller cancelled the run
    #[error("Migration run cancelled")]
    Cancelled,

    /// A generated identifier failed validation before interpolation
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Configuration could not be used
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MigrateError {
    /// Create an IO error bound to a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a query error with a description of what was being done.
    pub fn query(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Query {
            context: context.into(),
            source,
        }
    }

    /// Create a shadow setup error.
    pub fn shadow_setup(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::ShadowSetup {
            message: message.into(),
            source: source.into(),
        }
    }

    /// True when another run recorded the same change first.
    ///
    /// Callers layering idempotent retry on top of the engine may treat this
    /// as "already applied" instead of a hard failure.
    pub fn is_concurrent_apply(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }

    /// Name of the change this error concerns, if any.
    pub fn migration_name(&self) -> Option<&str> {
        match self {
            Self::Constraint { name, .. }
            | Self::Execute { name, .. }
            | Self::ShadowReplay { name, .. }
            | Self::ShadowTest { name, .. }
            | Self::Timeout { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// True when a sqlx error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// True when the server cancelled a statement (`statement_timeout`, 57014).
pub(crate) fn is_query_canceled(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("57014"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_message_lists_every_missing_file() {
        let err = MigrateError::Integrity {
            missing: vec!["001_users.sql".to_string(), "003_posts.sql".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 applied migration(s) missing"));
        assert!(msg.contains("001_users.sql, 003_posts.sql"));
    }

    #[test]
    fn test_shadow_test_names_the_change() {
        let err = MigrateError::ShadowTest {
            name: "002_invalid.sql".to_string(),
            source: Box::new(MigrateError::Cancelled),
        };
        assert_eq!(err.migration_name(), Some("002_invalid.sql"));
        assert!(err.to_string().contains("Shadow database test failed"));
        assert!(!err.is_concurrent_apply());
    }

    #[test]
    fn test_timeout_names_the_change() {
        let err = MigrateError::Timeout {
            name: "004_backfill.sql".to_string(),
            after: Duration::from_secs(300),
        };
        assert_eq!(err.migration_name(), Some("004_backfill.sql"));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_constraint_is_concurrent_apply() {
        let err = MigrateError::Constraint {
            name: "001_users.sql".to_string(),
            source: sqlx::Error::RowNotFound,
        };
        assert!(err.is_concurrent_apply());
    }

    #[test]
    fn test_row_not_found_is_not_unique_violation() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_query_canceled(&sqlx::Error::RowNotFound));
    }
}
