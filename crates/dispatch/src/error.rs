use std::time::Duration;

use thiserror::Error;

/// Why an event produced no reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("agent unavailable: {message}")]
    AgentUnavailable { message: String },

    #[error("agent timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("agent panicked: {message}")]
    Panicked { message: String },
}

impl DispatchError {
    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::AgentUnavailable {
            message: message.to_string(),
        }
    }
}
