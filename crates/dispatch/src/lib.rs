//! Event dispatch: drain the bus, ask the agent, route replies.

pub mod agent;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod router;

pub use {
    agent::{AgentCapability, AgentContext, EchoAgent, HttpAgent, build_agent},
    dispatcher::{DispatchRecord, DispatchSettings, Dispatcher},
    error::DispatchError,
    memory::{ConversationStore, InMemoryConversationStore, Role, StoredMessage},
    router::ReplyRouter,
};
