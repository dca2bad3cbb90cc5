//! Error types for the deployment engine
//!
//! Configuration errors are fatal and surface before any side effect.
//! Resolution, filesystem and notification errors are per secret and end up
//! in the run report.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Manifest parse and validation failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON in manifest {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Manifest {0} defines no secrets")]
    Empty(String),

    #[error("Invalid field {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("Secret '{0}' is defined twice with different settings")]
    DuplicateSecret(String),

    #[error("Secrets '{first}' and '{second}' both resolve to {path}")]
    PathCollision {
        first: String,
        second: String,
        path: PathBuf,
    },

    #[error("Template variable '{variable}' used by secret '{secret}' is not defined")]
    MissingVariable { secret: String, variable: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failures reported by a secret resolver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AuthDenied(String),

    #[error("Vault unavailable: {0}")]
    Unavailable(String),

    #[error("Deadline exceeded while resolving")]
    DeadlineExceeded,
}

impl ResolveError {
    /// Only transient failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Failures while materializing a secret on disk
#[derive(Error, Debug)]
pub enum FsError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Symlink conflict at {path}: {reason}")]
    SymlinkConflict { path: PathBuf, reason: String },

    #[error("Unknown user '{0}'")]
    UnknownUser(String),

    #[error("Unknown group '{0}'")]
    UnknownGroup(String),
}

impl FsError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Interrupted or timed-out syscalls may succeed on a second attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Failures while restarting or signaling a service
#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    #[error("Failed to restart {service}: {message}")]
    Restart { service: String, message: String },

    #[error("Failed to send {signal} to {service}: {message}")]
    Signal {
        service: String,
        signal: String,
        message: String,
    },
}

/// Hash store persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read hash store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt hash store {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write hash store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-secret failure carried in the run report
#[derive(Error, Debug)]
pub enum SecretError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Filesystem(#[from] FsError),
}

/// Errors that stop a run before it produces a report
#[derive(Error, Debug)]
pub enum DeployError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
