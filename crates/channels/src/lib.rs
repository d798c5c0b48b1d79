//! Channel adapters and the registry that supervises them.
//!
//! Each configured channel gets one adapter (webhook or long-poll) and a
//! supervision task that reconnects with backoff and feeds inbound events
//! onto the shared event bus.

pub mod adapter;
pub mod error;
pub mod health;
pub mod long_poll;
pub mod registry;
mod supervise;
pub mod webhook;

pub use {
    adapter::{AdapterFactory, ChannelAdapter, DefaultAdapterFactory, Delivery},
    error::{AdapterError, Error, Result},
    health::{HealthState, HealthStatus, HealthTracker, HealthTransition},
    long_poll::LongPollAdapter,
    registry::{ChannelRegistry, ChannelReport, ChannelSummary},
    supervise::SupervisionSettings,
    webhook::WebhookAdapter,
};
