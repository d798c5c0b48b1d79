//! The completion capability the dispatcher invokes for every event.

use std::sync::Arc;

use {
    anyhow::{Context, bail},
    async_trait::async_trait,
    bambooclaw_common::{AuthContext, EventId, EventSource, Payload, ReplyContent},
    bambooclaw_config::{ProviderConfig, ProviderKind},
    bambooclaw_security::SecurityGate,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::memory::StoredMessage;

/// What the agent knows about the event it is answering.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub event_id: EventId,
    pub source: EventSource,
    /// `source:conversation`, stable across events of one conversation.
    pub conversation: String,
    pub auth: AuthContext,
    /// Relevant prior messages, most relevant first.
    pub history: Vec<StoredMessage>,
}

#[async_trait]
pub trait AgentCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        context: &AgentContext,
        input: &Payload,
    ) -> anyhow::Result<Vec<ReplyContent>>;
}

/// Answers every input with the input itself.
#[derive(Debug, Default)]
pub struct EchoAgent;

#[async_trait]
impl AgentCapability for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(
        &self,
        _context: &AgentContext,
        input: &Payload,
    ) -> anyhow::Result<Vec<ReplyContent>> {
        Ok(vec![ReplyContent {
            text: input.text.clone(),
            attachments: input.attachments.clone(),
        }])
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    conversation: &'a str,
    input: &'a Payload,
    history: &'a [StoredMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CompletionResponse {
    Replies { replies: Vec<ReplyContent> },
    Single { text: String },
}

/// POSTs `{conversation, input, history}` to an endpoint and reads back
/// `{"replies": [...]}` or `{"text": "..."}`.
pub struct HttpAgent {
    endpoint: String,
    api_key: Option<Secret<String>>,
    model: Option<String>,
    gate: Arc<SecurityGate>,
    client: reqwest::Client,
}

impl HttpAgent {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, gate: Arc<SecurityGate>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: None,
            gate,
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, key: Secret<String>) -> Self {
        self.api_key = Some(key);
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl AgentCapability for HttpAgent {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(
        &self,
        context: &AgentContext,
        input: &Payload,
    ) -> anyhow::Result<Vec<ReplyContent>> {
        self.gate.require_egress(&self.endpoint)?;
        let body = CompletionRequest {
            conversation: &context.conversation,
            input,
            history: &context.history,
            model: self.model.as_deref(),
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("calling agent endpoint {}", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            bail!("agent endpoint returned {status}");
        }
        let parsed: CompletionResponse = response
            .json()
            .await
            .context("agent endpoint returned malformed JSON")?;
        let replies = match parsed {
            CompletionResponse::Replies { replies } => replies,
            CompletionResponse::Single { text } => vec![ReplyContent::text(text)],
        };
        debug!(conversation = %context.conversation, replies = replies.len(), "agent completed");
        Ok(replies)
    }
}

/// Build the configured agent.
pub fn build_agent(
    config: &ProviderConfig,
    gate: Arc<SecurityGate>,
) -> anyhow::Result<Arc<dyn AgentCapability>> {
    match config.kind {
        ProviderKind::Echo => Ok(Arc::new(EchoAgent)),
        ProviderKind::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .context("provider.endpoint is required for the http provider")?;
            let mut agent = HttpAgent::new(endpoint, gate);
            if let Some(key) = &config.api_key {
                agent = agent.with_api_key(key.clone());
            }
            if let Some(model) = &config.model {
                agent = agent.with_model(model.clone());
            }
            Ok(Arc::new(agent))
        },
    }
}
