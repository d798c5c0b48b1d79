//! Conversation history: store messages per conversation and retrieve the
//! ones most relevant to a new input.

use std::{collections::HashSet, num::NonZeroUsize, sync::RwLock};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    lru::LruCache,
    serde::{Deserialize, Serialize},
    tracing::debug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl StoredMessage {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// Persistence and search capability for conversation history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn store(&self, conversation_id: &str, message: StoredMessage) -> anyhow::Result<()>;

    /// Up to `limit` messages from the conversation, most relevant to `text`
    /// first.
    async fn query(
        &self,
        conversation_id: &str,
        text: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredMessage>>;
}

const DEFAULT_MAX_PER_CONVERSATION: usize = 500;
const DEFAULT_MAX_CONVERSATIONS: usize = 1_000;

/// Process-local store ranking by shared-term overlap, newest first on ties.
///
/// Holds at most `max_conversations` conversations; the one written to least
/// recently is dropped first.
pub struct InMemoryConversationStore {
    conversations: RwLock<LruCache<String, Vec<StoredMessage>>>,
    max_per_conversation: usize,
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_CONVERSATION)
    }
}

impl InMemoryConversationStore {
    #[must_use]
    pub fn new(max_per_conversation: usize) -> Self {
        Self::with_limits(max_per_conversation, DEFAULT_MAX_CONVERSATIONS)
    }

    #[must_use]
    pub fn with_limits(max_per_conversation: usize, max_conversations: usize) -> Self {
        let capacity = NonZeroUsize::new(max_conversations).unwrap_or(NonZeroUsize::MIN);
        Self {
            conversations: RwLock::new(LruCache::new(capacity)),
            max_per_conversation: max_per_conversation.max(1),
        }
    }

    #[must_use]
    pub fn len(&self, conversation_id: &str) -> usize {
        self.conversations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peek(conversation_id)
            .map_or(0, Vec::len)
    }

    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.conversations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn store(&self, conversation_id: &str, message: StoredMessage) -> anyhow::Result<()> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if !conversations.contains(conversation_id)
            && let Some((evicted, _)) = conversations.push(conversation_id.to_string(), Vec::new())
        {
            debug!(conversation = %evicted, "evicted idle conversation history");
        }
        let Some(messages) = conversations.get_mut(conversation_id) else {
            return Ok(());
        };
        messages.push(message);
        if messages.len() > self.max_per_conversation {
            let excess = messages.len() - self.max_per_conversation;
            messages.drain(..excess);
        }
        Ok(())
    }

    async fn query(
        &self,
        conversation_id: &str,
        text: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let Some(messages) = conversations.peek(conversation_id) else {
            return Ok(Vec::new());
        };

        let wanted = terms(text);
        let mut scored: Vec<(usize, usize, &StoredMessage)> = messages
            .iter()
            .enumerate()
            .map(|(idx, msg)| {
                let overlap = terms(&msg.text).intersection(&wanted).count();
                (overlap, idx, msg)
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, msg)| msg.clone())
            .collect())
    }
}
