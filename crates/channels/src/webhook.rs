//! Request-driven channel. Inbound traffic arrives through the gateway, so
//! `receive` only waits for disconnect; outbound replies are POSTed to the
//! configured endpoint or kept in a bounded outbox.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    bambooclaw_common::{Event, Reply},
    bambooclaw_config::{ChannelConfig, ChannelKind},
    bambooclaw_security::SecurityGate,
    futures::{StreamExt, stream::BoxStream},
    secrecy::Secret,
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

use crate::{
    adapter::{ChannelAdapter, Delivery, post_reply},
    error::AdapterError,
    health::{HealthState, HealthStatus},
};

const OUTBOX_CAPACITY: usize = 256;

pub struct WebhookAdapter {
    name: String,
    endpoint: Option<String>,
    credentials: Option<Secret<String>>,
    gate: Arc<SecurityGate>,
    client: reqwest::Client,
    connected: AtomicBool,
    cancel: Mutex<CancellationToken>,
    outbox: Mutex<VecDeque<Reply>>,
}

impl WebhookAdapter {
    #[must_use]
    pub fn new(config: &ChannelConfig, gate: Arc<SecurityGate>, client: reqwest::Client) -> Self {
        Self {
            name: config.name.clone(),
            endpoint: config.endpoint.clone(),
            credentials: config.credentials.clone(),
            gate,
            client,
            connected: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Replies held because no endpoint is configured, oldest first.
    #[must_use]
    pub fn outbox(&self) -> Vec<Reply> {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if let Some(endpoint) = &self.endpoint {
            self.gate.require_egress(endpoint)?;
        }
        let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(channel = %self.name, "webhook channel ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        self.current_token().cancel();
        Ok(())
    }

    fn receive(&self) -> BoxStream<'static, Result<Event, AdapterError>> {
        let token = self.current_token();
        futures::stream::once(async move { token.cancelled_owned().await })
            .filter_map(|()| futures::future::ready(None::<Result<Event, AdapterError>>))
            .boxed()
    }

    async fn send(&self, reply: &Reply) -> Result<Delivery, AdapterError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AdapterError::Disconnected);
        }
        match &self.endpoint {
            Some(endpoint) => {
                self.gate.require_egress(endpoint)?;
                post_reply(&self.client, endpoint, self.credentials.as_ref(), reply).await
            },
            None => {
                let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
                if outbox.len() == OUTBOX_CAPACITY {
                    outbox.pop_front();
                }
                outbox.push_back(reply.clone());
                Ok(Delivery::Delivered)
            },
        }
    }

    async fn health(&self) -> HealthStatus {
        if self.connected.load(Ordering::SeqCst) {
            HealthStatus::new(HealthState::Online, None)
        } else {
            HealthStatus::new(HealthState::Offline, None)
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        bambooclaw_common::{AuthContext, EventSource, Payload, ReplyContent},
        bambooclaw_config::{GatewayConfig, SecurityConfig},
        std::{path::Path, time::Duration},
    };

    fn gate(allow: &[&str]) -> Arc<SecurityGate> {
        let security = SecurityConfig {
            egress_allowlist: allow.iter().map(|s| s.to_string()).collect(),
            ..SecurityConfig::default()
        };
        Arc::new(SecurityGate::from_config(
            &security,
            &GatewayConfig::default(),
            Path::new("/nonexistent"),
        ))
    }

    fn reply(text: &str) -> Reply {
        let event = Event::new(
            EventSource::channel("hooks"),
            "c1",
            Payload::text("in"),
            AuthContext::Anonymous,
        );
        Reply::to_event(&event, ReplyContent::text(text))
    }

    #[tokio::test]
    async fn outbox_without_endpoint() {
        let adapter = WebhookAdapter::new(
            &ChannelConfig::new("hooks", ChannelKind::Webhook),
            gate(&[]),
            reqwest::Client::new(),
        );
        assert!(matches!(
            adapter.send(&reply("early")).await,
            Err(AdapterError::Disconnected)
        ));

        adapter.connect().await.unwrap();
        assert_eq!(adapter.send(&reply("one")).await.unwrap(), Delivery::Delivered);
        let outbox = adapter.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].content.text, "one");
    }

    #[tokio::test]
    async fn receive_ends_on_disconnect() {
        let adapter = WebhookAdapter::new(
            &ChannelConfig::new("hooks", ChannelKind::Webhook),
            gate(&[]),
            reqwest::Client::new(),
        );
        adapter.connect().await.unwrap();
        let mut stream = adapter.receive();
        let pending = tokio::time::timeout(Duration::from_millis(30), stream.next()).await;
        assert!(pending.is_err(), "stream should stay pending while connected");

        adapter.disconnect().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(adapter.health().await.state, HealthState::Offline);

        adapter.connect().await.unwrap();
        let mut again = adapter.receive();
        let pending = tokio::time::timeout(Duration::from_millis(30), again.next()).await;
        assert!(pending.is_err(), "a reconnect gives a fresh pending stream");
    }

    #[tokio::test]
    async fn endpoint_must_be_allowlisted() {
        let config = ChannelConfig::new("hooks", ChannelKind::Webhook)
            .with_endpoint("http://127.0.0.1:9/hook");
        let adapter = WebhookAdapter::new(&config, gate(&[]), reqwest::Client::new());
        assert!(matches!(
            adapter.connect().await,
            Err(AdapterError::Security(_))
        ));
    }

    #[tokio::test]
    async fn posts_to_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(200)
            .create_async()
            .await;
        let config = ChannelConfig::new("hooks", ChannelKind::Webhook)
            .with_endpoint(format!("{}/hook", server.url()));
        let adapter = WebhookAdapter::new(&config, gate(&["127.0.0.1"]), reqwest::Client::new());
        adapter.connect().await.unwrap();
        assert_eq!(adapter.send(&reply("x")).await.unwrap(), Delivery::Delivered);
        mock.assert_async().await;
        assert!(adapter.outbox().is_empty());
    }
}
