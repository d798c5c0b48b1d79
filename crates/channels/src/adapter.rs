use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    bambooclaw_common::{Event, Reply},
    bambooclaw_config::{ChannelConfig, ChannelKind},
    bambooclaw_security::SecurityGate,
    futures::stream::BoxStream,
    secrecy::{ExposeSecret, Secret},
    serde::Serialize,
};

use crate::{
    error::AdapterError,
    health::HealthStatus,
    long_poll::LongPollAdapter,
    webhook::WebhookAdapter,
};

/// Result of handing a reply to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Rejected(String),
    Throttled { retry_after: Duration },
}

impl Delivery {
    /// Anything but `Delivered` as an error.
    pub fn into_result(self) -> Result<(), AdapterError> {
        match self {
            Self::Delivered => Ok(()),
            Self::Rejected(reason) => Err(AdapterError::SendRejected { reason }),
            Self::Throttled { retry_after } => Err(AdapterError::Throttled { retry_after }),
        }
    }
}

/// Capability set every channel family implements. One instance per
/// configured channel; the registry owns it behind an `Arc`.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// Establish the connection. Called again after every failure.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Tear down the connection. Ends any stream returned by `receive`.
    async fn disconnect(&self) -> Result<(), AdapterError>;

    /// Inbound events. Lazy and unbounded while connected; a fresh stream is
    /// requested after each reconnect.
    fn receive(&self) -> BoxStream<'static, Result<Event, AdapterError>>;

    async fn send(&self, reply: &Reply) -> Result<Delivery, AdapterError>;

    /// Probe the adapter's own view of its health.
    async fn health(&self) -> HealthStatus;
}

/// Builds adapters from config. The registry calls it on every `start`.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, config: &ChannelConfig) -> Result<Arc<dyn ChannelAdapter>, AdapterError>;
}

/// Builds the built-in webhook and long-poll adapters.
pub struct DefaultAdapterFactory {
    gate: Arc<SecurityGate>,
    client: reqwest::Client,
}

impl DefaultAdapterFactory {
    #[must_use]
    pub fn new(gate: Arc<SecurityGate>) -> Self {
        Self {
            gate,
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn build(&self, config: &ChannelConfig) -> Result<Arc<dyn ChannelAdapter>, AdapterError> {
        match config.kind {
            ChannelKind::Webhook => Ok(Arc::new(WebhookAdapter::new(
                config,
                Arc::clone(&self.gate),
                self.client.clone(),
            ))),
            ChannelKind::LongPoll => Ok(Arc::new(LongPollAdapter::new(
                config,
                Arc::clone(&self.gate),
                self.client.clone(),
            )?)),
        }
    }
}

/// JSON body POSTed for an outbound reply.
#[derive(Serialize)]
pub(crate) struct OutboundMessage<'a> {
    pub event_id: String,
    pub conversation: &'a str,
    pub text: &'a str,
    pub attachments: &'a [bambooclaw_common::Attachment],
}

impl<'a> OutboundMessage<'a> {
    pub fn from_reply(reply: &'a Reply) -> Self {
        Self {
            event_id: reply.event_id.to_string(),
            conversation: &reply.target_conversation,
            text: &reply.content.text,
            attachments: &reply.content.attachments,
        }
    }
}

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_REASON_LEN: usize = 200;

/// POST `reply` to `url` and classify the response: 2xx delivered, 429
/// throttled, other 4xx rejected, anything else an error.
pub(crate) async fn post_reply(
    client: &reqwest::Client,
    url: &str,
    credentials: Option<&Secret<String>>,
    reply: &Reply,
) -> Result<Delivery, AdapterError> {
    let mut request = client.post(url).json(&OutboundMessage::from_reply(reply));
    if let Some(credentials) = credentials {
        request = request.bearer_auth(credentials.expose_secret());
    }
    let response = request.send().await?;
    let status = response.status();

    if status.is_success() {
        return Ok(Delivery::Delivered);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return Ok(Delivery::Throttled { retry_after });
    }
    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_REASON_LEN).collect();
        let reason = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };
        return Ok(Delivery::Rejected(reason));
    }
    Err(AdapterError::transport(format!("peer returned {status}")))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        bambooclaw_common::{AuthContext, EventSource, Payload, ReplyContent},
        rstest::rstest,
    };

    fn reply() -> Reply {
        let event = Event::new(
            EventSource::channel("ops"),
            "room-1",
            Payload::text("hi"),
            AuthContext::Anonymous,
        );
        Reply::to_event(&event, ReplyContent::text("hello back"))
    }

    #[rstest]
    #[case(200, None, Delivery::Delivered)]
    #[case(204, None, Delivery::Delivered)]
    #[case(429, Some("7"), Delivery::Throttled { retry_after: Duration::from_secs(7) })]
    #[case(429, None, Delivery::Throttled { retry_after: DEFAULT_RETRY_AFTER })]
    #[tokio::test]
    async fn classifies_responses(
        #[case] status: usize,
        #[case] retry_after: Option<&str>,
        #[case] expected: Delivery,
    ) {
        let mut server = mockito::Server::new_async().await;
        let mut mock = server.mock("POST", "/send").with_status(status);
        if let Some(value) = retry_after {
            mock = mock.with_header("retry-after", value);
        }
        let _mock = mock.create_async().await;

        let url = format!("{}/send", server.url());
        let delivery = post_reply(&reqwest::Client::new(), &url, None, &reply())
            .await
            .unwrap();
        assert_eq!(delivery, expected);
    }

    #[tokio::test]
    async fn client_error_is_rejection_with_reason() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/send")
            .with_status(403)
            .with_body("conversation closed")
            .create_async()
            .await;
        let url = format!("{}/send", server.url());
        match post_reply(&reqwest::Client::new(), &url, None, &reply())
            .await
            .unwrap()
        {
            Delivery::Rejected(reason) => assert!(reason.contains("conversation closed")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/send")
            .with_status(503)
            .create_async()
            .await;
        let url = format!("{}/send", server.url());
        let err = post_reply(&reqwest::Client::new(), &url, None, &reply())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Transport { .. }));
    }

    #[tokio::test]
    async fn sends_bearer_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_header("authorization", "Bearer tok")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "conversation": "room-1",
                "text": "hello back",
            })))
            .with_status(200)
            .create_async()
            .await;
        let url = format!("{}/send", server.url());
        let creds = Secret::new("tok".to_string());
        post_reply(&reqwest::Client::new(), &url, Some(&creds), &reply())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn delivery_into_result() {
        assert!(Delivery::Delivered.into_result().is_ok());
        assert!(matches!(
            Delivery::Rejected("no".into()).into_result(),
            Err(AdapterError::SendRejected { .. })
        ));
    }
}
