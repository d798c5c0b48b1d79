//! Shared types, error definitions, and the event bus used across all
//! bambooclaw crates.

pub mod bus;
pub mod error;
pub mod types;

pub use {
    bus::{Envelope, EventReceiver, EventSender, Outcome, event_bus},
    error::{Error, FromMessage, Result},
    types::{
        Attachment, AuthContext, Event, EventId, EventSource, Payload, Reply, ReplyContent,
        TokenScope,
    },
};
