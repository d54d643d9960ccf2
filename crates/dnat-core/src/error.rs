//! Error types for the reconciliation loop.
//!
//! Only two conditions are allowed to stop the process: a configuration
//! file that cannot be read, and a configuration whose content is corrupt
//! (an unrecognized rule kind, or a structured file that does not parse).
//! Everything else is confined to the cycle or declaration it occurred in.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the reconciliation loop
#[derive(Error, Debug)]
pub enum Error {
    /// The rules file could not be read. A missing config is an operator
    /// error, not a transient condition, so this is never retried.
    #[error("config file {path} cannot be read: {source}")]
    ConfigNotFound {
        /// Path that was attempted
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A structured config file exists but its content does not parse
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A declaration names a rule kind outside {SINGLE, RANGE}
    #[error("unrecognized rule kind `{kind}` in declaration `{line}`")]
    UnknownRuleKind {
        /// The offending kind field
        kind: String,
        /// The full declaration line
        line: String,
    },

    /// The local outbound address probe failed for this cycle
    #[error("local outbound address unavailable: {0}")]
    LocalAddressUnavailable(String),
}

impl Error {
    /// Create a `ConfigNotFound` error
    pub fn config_not_found(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source,
        }
    }

    /// Create an `InvalidConfig` error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an `UnknownRuleKind` error
    pub fn unknown_rule_kind(kind: impl Into<String>, line: impl Into<String>) -> Self {
        Self::UnknownRuleKind {
            kind: kind.into(),
            line: line.into(),
        }
    }

    /// Create a `LocalAddressUnavailable` error
    pub fn local_address_unavailable(msg: impl Into<String>) -> Self {
        Self::LocalAddressUnavailable(msg.into())
    }

    /// Whether this error must terminate the process.
    ///
    /// Non-fatal errors end the current cycle; the loop logs them and
    /// runs again after the usual sleep.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. } | Self::InvalidConfig(_) | Self::UnknownRuleKind { .. }
        )
    }
}
