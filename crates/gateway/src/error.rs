use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    bambooclaw_security::{AuthError, PairingError},
    thiserror::Error,
};

/// Handler failures. Every variant renders as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("timed out waiting for a reply")]
    Timeout,

    /// The dispatcher handled the event but produced no reply.
    #[error("{0}")]
    Dispatch(String),

    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Pairing(PairingError::NotConfigured) => StatusCode::FORBIDDEN,
            Self::Pairing(PairingError::InvalidCode) => StatusCode::UNAUTHORIZED,
            Self::Pairing(PairingError::LockedOut { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Self::Pairing(PairingError::Entropy(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Dispatch(_) => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
