//! Typed errors for the bootstrap and migration pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::Stage;

/// Fatal errors. Any of these aborts the run; per-patch failures are not
/// errors and show up in the run report instead.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Required settings missing or malformed. Raised before any connection attempt.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connectivity probe still failing after the retry budget was spent.
    #[error("could not connect to {target} after {attempts} attempts: {source}")]
    Connection {
        target: String,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// The wall-clock bound on waiting for a connection elapsed.
    #[error("gave up waiting for {target} after {elapsed:?}")]
    ConnectionTimeout { target: String, elapsed: Duration },

    /// Database or role existence check / creation failed.
    #[error("{stage} failed for {identifier}: {source}")]
    Bootstrap {
        stage: Stage,
        identifier: String,
        #[source]
        source: sqlx::Error,
    },

    /// Ledger table check, creation or read failed.
    #[error("{stage} failed: {source}")]
    Ledger {
        stage: Stage,
        #[source]
        source: sqlx::Error,
    },

    /// The patch directory could not be listed.
    #[error("failed to read patch directory {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A privilege statement failed. Patches applied earlier in the run stay applied.
    #[error("grant failed ({statement}): {source}")]
    Grant {
        statement: String,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Every missing setting is listed, not just the first one.
    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for pipeline operations.
pub type MigrateResult<T> = std::result::Result<T, MigrateError>;
