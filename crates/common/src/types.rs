//! Canonical event model shared by every component.
//!
//! Every inbound stimulus (channel message, webhook call, cron fire) becomes an
//! [`Event`]; everything the agent produces for a channel is a [`Reply`].

use std::{fmt, str::FromStr};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

/// Unique event identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where an event came from. Serialized as a plain string: the channel name,
/// `"cron"`, or `"gateway"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventSource {
    Channel(String),
    Cron,
    Gateway,
}

impl EventSource {
    pub const CRON: &'static str = "cron";
    pub const GATEWAY: &'static str = "gateway";

    /// Names that can never be used for a channel.
    pub const RESERVED: &'static [&'static str] = &[Self::CRON, Self::GATEWAY];

    #[must_use]
    pub fn channel(name: impl Into<String>) -> Self {
        Self::Channel(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Channel(name) => name,
            Self::Cron => Self::CRON,
            Self::Gateway => Self::GATEWAY,
        }
    }

    /// The channel name when this event has a return channel.
    #[must_use]
    pub fn channel_name(&self) -> Option<&str> {
        match self {
            Self::Channel(name) => Some(name),
            Self::Cron | Self::Gateway => None,
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventSource> for String {
    fn from(source: EventSource) -> Self {
        source.as_str().to_string()
    }
}

impl From<String> for EventSource {
    fn from(value: String) -> Self {
        match value.as_str() {
            Self::CRON => Self::Cron,
            Self::GATEWAY => Self::Gateway,
            _ => Self::Channel(value),
        }
    }
}

/// Permission carried by a pairing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenScope {
    /// May call `POST /webhook`.
    #[default]
    Webhook,
    /// Full operator access; covers every other scope.
    Admin,
}

impl TokenScope {
    /// Whether a token with this scope satisfies `required`.
    #[must_use]
    pub fn covers(self, required: TokenScope) -> bool {
        self == Self::Admin || self == required
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webhook" => Ok(Self::Webhook),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown token scope: {other}")),
        }
    }
}

/// Identity of whoever caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthContext {
    /// No caller identity (cron fires, internal events).
    Anonymous,
    /// A gateway caller holding a verified bearer token. `token_id` is a
    /// digest prefix, never the token itself.
    Token { token_id: String, scope: TokenScope },
    /// A sender on a channel the adapter has already authenticated.
    Channel {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
}

/// Reference to an attachment stored outside the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Inbound content: text plus optional attachment references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Payload {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

/// A canonical inbound event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    source: EventSource,
    origin_conversation: String,
    payload: Payload,
    received_at: DateTime<Utc>,
    auth: AuthContext,
}

impl Event {
    #[must_use]
    pub fn new(
        source: EventSource,
        origin_conversation: impl Into<String>,
        payload: Payload,
        auth: AuthContext,
    ) -> Self {
        Self {
            id: EventId::new(),
            source,
            origin_conversation: origin_conversation.into(),
            payload,
            received_at: Utc::now(),
            auth,
        }
    }

    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    #[must_use]
    pub fn source(&self) -> &EventSource {
        &self.source
    }

    #[must_use]
    pub fn origin_conversation(&self) -> &str {
        &self.origin_conversation
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    #[must_use]
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Conversation key that is unique across sources.
    #[must_use]
    pub fn conversation_key(&self) -> String {
        format!("{}:{}", self.source, self.origin_conversation)
    }
}

/// Outbound content produced by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ReplyContent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// Outbound message destined for the channel an event came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub event_id: EventId,
    pub target_conversation: String,
    pub content: ReplyContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_deadline: Option<DateTime<Utc>>,
}

impl Reply {
    /// Build a reply addressed back to the conversation `event` came from.
    #[must_use]
    pub fn to_event(event: &Event, content: ReplyContent) -> Self {
        Self {
            event_id: event.id(),
            target_conversation: event.origin_conversation().to_string(),
            content,
            delivery_deadline: None,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.delivery_deadline = Some(deadline);
        self
    }

    /// Whether the delivery deadline has already passed.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.delivery_deadline.is_some_and(|d| d < now)
    }
}
