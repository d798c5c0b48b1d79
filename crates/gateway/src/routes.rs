//! `POST /pair`, `POST /webhook`, `GET /health`.

use std::sync::Arc;

use {
    axum::{
        Extension, Json,
        extract::{State, rejection::JsonRejection},
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    bambooclaw_common::{
        Attachment, AuthContext, Event, EventSource, Outcome, Payload, Reply, TokenScope,
    },
    bambooclaw_config::ReplyMode,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

use crate::{error::ApiError, state::GatewayState};

/// Conversation used when a gateway caller names none and holds no token id.
const DEFAULT_CONVERSATION: &str = "default";

#[derive(Debug, Deserialize)]
pub struct PairRequest {
    pub code: String,
    #[serde(default)]
    pub scope: TokenScope,
}

#[derive(Debug, Serialize)]
pub struct PairResponse {
    pub token: String,
    pub scope: TokenScope,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn pair(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> Result<Json<PairResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let token = state.gate.pair(&request.code, request.scope)?;
    Ok(Json(PairResponse {
        token: token.expose().to_string(),
        scope: token.scope,
        issued_at: token.issued_at,
        expires_at: token.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    /// Configured channel this call speaks for. Replies go back through it.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
pub struct WebhookReply {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl From<Reply> for WebhookReply {
    fn from(reply: Reply) -> Self {
        Self {
            text: reply.content.text,
            attachments: reply.content.attachments,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookResponse {
    Accepted {
        event_id: String,
    },
    Completed {
        event_id: String,
        replies: Vec<WebhookReply>,
        delivered: usize,
    },
}

pub async fn webhook(
    State(state): State<Arc<GatewayState>>,
    Extension(auth): Extension<AuthContext>,
    body: Result<Json<WebhookRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let event = build_event(&state, request, auth)?;
    let event_id = event.id().to_string();
    debug!(event_id = %event_id, source = %event.source(), "webhook accepted");

    match state.reply_mode {
        ReplyMode::Ack => {
            state
                .events
                .send(event)
                .await
                .map_err(|e| ApiError::Unavailable(e.to_string()))?;
            Ok((StatusCode::ACCEPTED, Json(WebhookResponse::Accepted { event_id })).into_response())
        },
        ReplyMode::Sync => {
            let done = state
                .events
                .send_tracked(event)
                .await
                .map_err(|e| ApiError::Unavailable(e.to_string()))?;
            let outcome = match tokio::time::timeout(state.request_timeout, done).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => {
                    return Err(ApiError::Unavailable("dispatcher dropped the event".into()));
                },
                Err(_) => {
                    warn!(event_id = %event_id, "webhook timed out waiting for dispatcher");
                    return Err(ApiError::Timeout);
                },
            };
            match outcome {
                Outcome::Completed { replies, delivered } => {
                    info!(event_id = %event_id, replies = replies.len(), delivered, "webhook completed");
                    Ok(Json(WebhookResponse::Completed {
                        event_id,
                        replies: replies.into_iter().map(WebhookReply::from).collect(),
                        delivered,
                    })
                    .into_response())
                },
                Outcome::Failed { error } => Err(ApiError::Dispatch(error)),
            }
        },
    }
}

/// Validate the payload and turn it into an event. Nothing here touches the bus.
fn build_event(
    state: &GatewayState,
    request: WebhookRequest,
    auth: AuthContext,
) -> Result<Event, ApiError> {
    let payload = Payload {
        text: request.text,
        attachments: request.attachments,
    };
    if payload.is_empty() {
        return Err(ApiError::bad_request("payload has no text or attachments"));
    }

    let source = match request.channel.as_deref().map(str::trim) {
        None | Some("") => EventSource::Gateway,
        Some(name) if EventSource::RESERVED.contains(&name) => {
            return Err(ApiError::bad_request(format!(
                "'{name}' is not a channel name"
            )));
        },
        Some(name) => match &state.channels {
            Some(channels) if channels.contains(name) => EventSource::channel(name),
            _ => return Err(ApiError::bad_request(format!("unknown channel: {name}"))),
        },
    };

    let conversation = match request.conversation.as_deref().map(str::trim) {
        Some(conversation) if !conversation.is_empty() => conversation.to_string(),
        _ => match &auth {
            AuthContext::Token { token_id, .. } => token_id.clone(),
            AuthContext::Anonymous | AuthContext::Channel { .. } => {
                DEFAULT_CONVERSATION.to_string()
            },
        },
    };

    Ok(Event::new(source, conversation, payload, auth))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub uptime_secs: u64,
}

/// Public liveness probe. Reveals nothing about channels or tokens.
pub async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: state.version.clone(),
        uptime_secs: state.uptime().as_secs(),
    })
}
