use std::time::Duration;

use bambooclaw_security::SecurityError;

/// Failures raised by a single adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("connect failed: {message}")]
    ConnectFailed { message: String },

    #[error("send rejected: {reason}")]
    SendRejected { reason: String },

    #[error("throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("disconnected")]
    Disconnected,

    #[error("invalid channel config: {message}")]
    InvalidConfig { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error(transparent)]
    Security(#[from] SecurityError),
}

impl AdapterError {
    #[must_use]
    pub fn connect_failed(message: impl std::fmt::Display) -> Self {
        Self::ConnectFailed {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_config(message: impl std::fmt::Display) -> Self {
        Self::InvalidConfig {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        Self::transport(e)
    }
}

/// Crate-wide result type for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown channel: {name}")]
    UnknownChannel { name: String },

    /// Config changes and removal are refused while a channel runs.
    #[error("channel {name} is running; stop it first")]
    Running { name: String },

    #[error("channel {name} is not running")]
    NotRunning { name: String },

    #[error("invalid channel input: {message}")]
    InvalidInput { message: String },

    #[error("channel {name}: {source}")]
    Adapter {
        name: String,
        #[source]
        source: AdapterError,
    },
}

impl Error {
    #[must_use]
    pub fn unknown(name: impl std::fmt::Display) -> Self {
        Self::UnknownChannel {
            name: name.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn adapter(name: impl std::fmt::Display, source: AdapterError) -> Self {
        Self::Adapter {
            name: name.to_string(),
            source,
        }
    }
}
