use std::path::PathBuf;

use thiserror::Error;

/// Filesystem and network policy denials.
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("path escapes the workspace: {path}")]
    Escape { path: PathBuf },

    #[error("access denied to {path}: {reason}")]
    Denied { path: PathBuf, reason: String },

    #[error("refusing to bind to {host}: public bind is disabled")]
    PublicBindDenied { host: String },

    #[error("egress to {host} denied")]
    EgressDenied { host: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SecurityError {
    #[must_use]
    pub fn denied(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Denied {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Bearer token verification failures. Display strings are safe to log; they
/// never contain the presented token.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing token")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("token scope does not permit this operation")]
    ScopeMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("pairing is not configured")]
    NotConfigured,
    #[error("invalid pairing code")]
    InvalidCode,
    #[error("pairing locked out, retry in {retry_after_secs}s")]
    LockedOut { retry_after_secs: u64 },
    #[error("OS random number generator failed: {0}")]
    Entropy(String),
}

pub type Result<T> = std::result::Result<T, SecurityError>;
