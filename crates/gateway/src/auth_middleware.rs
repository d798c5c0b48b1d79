use std::sync::Arc;

use {
    axum::{
        extract::{Request, State},
        http::{HeaderMap, header},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    bambooclaw_common::TokenScope,
    tracing::warn,
};

use crate::{error::ApiError, state::GatewayState};

/// Middleware that requires a webhook-scoped bearer token.
///
/// On success the verified `AuthContext` is attached as a request extension.
/// Failures answer 401 and log only the reason.
pub async fn require_bearer(
    State(state): State<Arc<GatewayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = bearer_token(request.headers());
    match state.gate.verify(token, TokenScope::Webhook) {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            next.run(request).await
        },
        Err(e) => {
            warn!(path = %request.uri().path(), reason = %e, "request rejected");
            ApiError::from(e).into_response()
        },
    }
}

/// The token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
