use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    bambooclaw_channels::ChannelRegistry,
    bambooclaw_common::EventSender,
    bambooclaw_config::{GatewayConfig, ReplyMode},
    bambooclaw_security::SecurityGate,
};

/// Shared state behind every gateway handler.
pub struct GatewayState {
    pub gate: Arc<SecurityGate>,
    /// Producer half of the event bus.
    pub events: EventSender,
    /// Channels a webhook call may speak for. `None` accepts gateway events only.
    pub channels: Option<ChannelRegistry>,
    pub reply_mode: ReplyMode,
    /// How long a `sync` webhook waits for the dispatcher.
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub version: String,
    pub started_at: Instant,
}

impl GatewayState {
    #[must_use]
    pub fn new(gate: Arc<SecurityGate>, events: EventSender, config: &GatewayConfig) -> Self {
        Self {
            gate,
            events,
            channels: None,
            reply_mode: config.reply_mode,
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            max_body_bytes: config.max_body_bytes,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_channels(mut self, channels: ChannelRegistry) -> Self {
        self.channels = Some(channels);
        self
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
