//! Persistent channel speaking a generic JSON long-poll protocol:
//!
//! - `GET {endpoint}/updates?offset=N&timeout=S` returns
//!   `{"updates":[{"id","conversation","text","sender"}]}`
//! - `POST {endpoint}/send` delivers a reply

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    bambooclaw_common::{AuthContext, Event, EventSource, Payload, Reply},
    bambooclaw_config::{ChannelConfig, ChannelKind},
    bambooclaw_security::SecurityGate,
    futures::{StreamExt, stream::BoxStream},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace},
};

use crate::{
    adapter::{ChannelAdapter, Delivery, post_reply},
    error::AdapterError,
    health::{HealthState, HealthStatus},
};

/// Extra time allowed on top of the server-side poll timeout.
const POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    updates: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    id: u64,
    conversation: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    sender: Option<String>,
}

/// State shared between the adapter and the streams it hands out.
struct Shared {
    name: String,
    base: String,
    credentials: Option<Secret<String>>,
    poll_timeout: Duration,
    client: reqwest::Client,
    offset: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    async fn poll_once(&self) -> Result<Vec<Event>, AdapterError> {
        let offset = self.offset.load(Ordering::SeqCst);
        let mut request = self
            .client
            .get(format!("{}/updates", self.base))
            .query(&[
                ("offset", offset),
                ("timeout", self.poll_timeout.as_secs()),
            ])
            .timeout(self.poll_timeout + POLL_GRACE);
        if let Some(credentials) = &self.credentials {
            request = request.bearer_auth(credentials.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::connect_failed(format!("poll failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::connect_failed(format!("poll returned {status}")));
        }
        let body: UpdatesResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::transport(format!("malformed updates: {e}")))?;

        let mut events = Vec::with_capacity(body.updates.len());
        for update in body.updates {
            self.offset
                .fetch_max(update.id.saturating_add(1), Ordering::SeqCst);
            if update.text.trim().is_empty() {
                trace!(channel = %self.name, id = update.id, "skipping empty update");
                continue;
            }
            events.push(Event::new(
                EventSource::channel(&self.name),
                update.conversation,
                Payload::text(update.text),
                AuthContext::Channel {
                    channel: self.name.clone(),
                    sender: update.sender,
                },
            ));
        }
        Ok(events)
    }
}

pub struct LongPollAdapter {
    shared: Arc<Shared>,
    gate: Arc<SecurityGate>,
    connected: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl LongPollAdapter {
    pub fn new(
        config: &ChannelConfig,
        gate: Arc<SecurityGate>,
        client: reqwest::Client,
    ) -> Result<Self, AdapterError> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Err(AdapterError::invalid_config(format!(
                "long_poll channel {} has no endpoint",
                config.name
            )));
        };
        Ok(Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                base: endpoint.trim_end_matches('/').to_string(),
                credentials: config.credentials.clone(),
                poll_timeout: Duration::from_secs(config.poll_timeout_secs),
                client,
                offset: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            gate,
            connected: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Next update id that will be requested.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.shared.offset.load(Ordering::SeqCst)
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct PollState {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    buffered: VecDeque<Event>,
}

#[async_trait]
impl ChannelAdapter for LongPollAdapter {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::LongPoll
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.gate.require_egress(&self.shared.base)?;
        {
            let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        self.shared.set_error(None);
        debug!(channel = %self.shared.name, endpoint = %self.shared.base, "long-poll channel connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        self.current_token().cancel();
        Ok(())
    }

    fn receive(&self) -> BoxStream<'static, Result<Event, AdapterError>> {
        let state = PollState {
            shared: Arc::clone(&self.shared),
            cancel: self.current_token(),
            buffered: VecDeque::new(),
        };
        futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(event) = st.buffered.pop_front() {
                    return Some((Ok(event), st));
                }
                let polled = tokio::select! {
                    () = st.cancel.cancelled() => return None,
                    polled = st.shared.poll_once() => polled,
                };
                match polled {
                    Ok(events) => {
                        st.shared.set_error(None);
                        st.buffered.extend(events);
                    },
                    Err(e) => {
                        st.shared.set_error(Some(e.to_string()));
                        return Some((Err(e), st));
                    },
                }
            }
        })
        .boxed()
    }

    async fn send(&self, reply: &Reply) -> Result<Delivery, AdapterError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AdapterError::Disconnected);
        }
        let url = format!("{}/send", self.shared.base);
        self.gate.require_egress(&url)?;
        post_reply(
            &self.shared.client,
            &url,
            self.shared.credentials.as_ref(),
            reply,
        )
        .await
    }

    async fn health(&self) -> HealthStatus {
        let last_error = self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let state = match (self.connected.load(Ordering::SeqCst), &last_error) {
            (false, _) => HealthState::Offline,
            (true, Some(_)) => HealthState::Degraded,
            (true, None) => HealthState::Online,
        };
        HealthStatus::new(state, last_error)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        bambooclaw_common::ReplyContent,
        bambooclaw_config::{GatewayConfig, SecurityConfig},
        mockito::Matcher,
        std::path::Path,
    };

    fn gate() -> Arc<SecurityGate> {
        let security = SecurityConfig {
            egress_allowlist: vec!["127.0.0.1".into()],
            ..SecurityConfig::default()
        };
        Arc::new(SecurityGate::from_config(
            &security,
            &GatewayConfig::default(),
            Path::new("/nonexistent"),
        ))
    }

    fn adapter(endpoint: &str) -> LongPollAdapter {
        let mut config = ChannelConfig::new("ops", ChannelKind::LongPoll)
            .with_endpoint(endpoint)
            .with_credentials("bot-token");
        config.poll_timeout_secs = 1;
        LongPollAdapter::new(&config, gate(), reqwest::Client::new()).unwrap()
    }

    #[test]
    fn requires_endpoint() {
        let config = ChannelConfig::new("ops", ChannelKind::LongPoll);
        assert!(matches!(
            LongPollAdapter::new(&config, gate(), reqwest::Client::new()),
            Err(AdapterError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn receives_updates_and_advances_offset() {
        let mut server = mockito::Server::new_async().await;
        let _first = server
            .mock("GET", "/updates")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("offset".into(), "0".into()),
                Matcher::UrlEncoded("timeout".into(), "1".into()),
            ]))
            .match_header("authorization", "Bearer bot-token")
            .with_body(
                r#"{"updates":[
                    {"id":5,"conversation":"room-a","text":"hello","sender":"alice"},
                    {"id":6,"conversation":"room-b","text":"  "},
                    {"id":7,"conversation":"room-b","text":"second"}
                ]}"#,
            )
            .create_async()
            .await;
        let _rest = server
            .mock("GET", "/updates")
            .match_query(Matcher::UrlEncoded("offset".into(), "8".into()))
            .with_body(r#"{"updates":[]}"#)
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        adapter.connect().await.unwrap();
        let mut stream = adapter.receive();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.source(), &EventSource::channel("ops"));
        assert_eq!(first.origin_conversation(), "room-a");
        assert_eq!(first.payload().text, "hello");
        assert_eq!(first.auth(), &AuthContext::Channel {
            channel: "ops".into(),
            sender: Some("alice".into()),
        });

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.payload().text, "second");
        assert_eq!(adapter.offset(), 8);

        adapter.disconnect().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn largest_update_id_pins_the_offset() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/updates")
            .match_query(Matcher::Any)
            .with_body(
                r#"{"updates":[{"id":18446744073709551615,"conversation":"room-a","text":"last"}]}"#,
            )
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        adapter.connect().await.unwrap();
        let mut stream = adapter.receive();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.payload().text, "last");
        assert_eq!(adapter.offset(), u64::MAX);
        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn poll_failure_surfaces_as_error_item() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/updates")
            .match_query(Matcher::Any)
            .with_status(502)
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        adapter.connect().await.unwrap();
        let mut stream = adapter.receive();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, AdapterError::ConnectFailed { .. }));
        assert_eq!(adapter.health().await.state, HealthState::Degraded);
    }

    #[tokio::test]
    async fn send_posts_to_send_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_header("authorization", "Bearer bot-token")
            .with_status(200)
            .create_async()
            .await;

        let adapter = adapter(&server.url());
        adapter.connect().await.unwrap();
        let event = Event::new(
            EventSource::channel("ops"),
            "room-a",
            Payload::text("q"),
            AuthContext::Anonymous,
        );
        let delivery = adapter
            .send(&Reply::to_event(&event, ReplyContent::text("a")))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Delivered);
        mock.assert_async().await;
    }
}
