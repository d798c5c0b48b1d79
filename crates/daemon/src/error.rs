use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("state file {path}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not valid JSON: {source}")]
    StateFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to start {component}: {message}")]
    Startup {
        component: &'static str,
        message: String,
    },
}

impl DaemonError {
    #[must_use]
    pub fn state_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StateIo {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn startup(component: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Startup {
            component,
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
