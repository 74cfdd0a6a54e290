//! Error types for the idmigrate core library.
//!
//! Each subsystem has its own error type derived with `thiserror`. Per-row
//! load problems and join orphans are not errors: they are collected as
//! [`LoadIssue`](crate::loader::LoadIssue) and
//! [`JoinWarning`](crate::identity::JoinWarning) values and never abort a run.

use thiserror::Error;

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

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Load errors
// ---------------------------------------------------------------------------

/// Fatal errors from the record loader.
///
/// Only problems that make a whole input unusable end up here; a bad row is
/// reported as a `LoadIssue` and skipped.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The input file could not be opened or read.
    #[error("cannot read input '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The header row is missing a column every row needs.
    #[error("input '{path}' has no '{column}' column")]
    MissingColumn { path: String, column: String },

    /// The CSV reader could not produce a header row at all.
    #[error("input '{path}' is not valid CSV: {detail}")]
    Csv { path: String, detail: String },
}

// ---------------------------------------------------------------------------
// Destination client errors
// ---------------------------------------------------------------------------

/// Errors from the destination tenant's administrative API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP-level transport error (network, TLS, timeout).
    #[error("destination HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("destination API error (HTTP {status}): {body}")]
    Remote { status: u16, body: String },

    /// The API asked us to slow down (HTTP 429).
    #[error("destination rate limit exceeded (HTTP 429): {body}")]
    RateLimited {
        retry_after_secs: Option<u64>,
        body: String,
    },

    /// Vendor credentials were rejected or no token was issued.
    #[error("destination authentication failed: {0}")]
    Authentication(String),

    /// A user with this identifying key already exists.
    #[error("user '{email}' already exists in the destination tenant")]
    Conflict { email: String },

    /// The response body did not have the expected shape.
    #[error("destination response parse error: {0}")]
    Parse(String),

    /// A transient failure persisted through every attempt.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },
}

impl ClientError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Conflict { .. } => Some(409),
            Self::RateLimited { .. } => Some(429),
            Self::RetriesExhausted { last, .. } => last.status(),
            Self::Authentication(_) | Self::Parse(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Result log errors
// ---------------------------------------------------------------------------

/// Errors from the append-only result log.
#[derive(Debug, Error)]
pub enum ResultLogError {
    /// The log file could not be opened, written, or flushed.
    #[error("result log I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A result could not be encoded.
    #[error("result log encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Migration errors
// ---------------------------------------------------------------------------

/// Batch-level failures from the orchestrator.
///
/// A failing unit is never one of these; it is recorded in the result log
/// and the batch moves on.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The destination API could not be reached or rejected the credentials
    /// before any unit was attempted.
    #[error("destination tenant unavailable: {0}")]
    DestinationUnavailable(#[source] ClientError),

    /// A completed result could not be persisted.
    #[error("failed to persist migration result: {0}")]
    ResultLog(#[from] ResultLogError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ClientError::Remote {
            status: 400,
            body: "bad email".into(),
        };
        assert_eq!(err.to_string(), "destination API error (HTTP 400): bad email");

        let err = ConfigError::EnvVarMissing {
            var: "DEST_SECRET".into(),
            field: "destination.secret_env".into(),
        };
        assert!(err.to_string().contains("DEST_SECRET"));

        let err = LoadError::MissingColumn {
            path: "users.csv".into(),
            column: "email".into(),
        };
        assert_eq!(err.to_string(), "input 'users.csv' has no 'email' column");
    }

    #[test]
    fn test_status_passes_through_retries() {
        let err = ClientError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ClientError::Remote {
                status: 503,
                body: "unavailable".into(),
            }),
        };
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().starts_with("gave up after 3 attempts"));
    }

    #[test]
    fn test_result_log_error_converts_to_migration_error() {
        let err: MigrationError = ResultLogError::Io {
            path: "results.jsonl".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        }
        .into();
        assert!(matches!(err, MigrationError::ResultLog(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
