//! Per-channel supervision loop: connect, drain `receive` into the event bus,
//! and reconnect with exponential backoff until too many failures pile up.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    bambooclaw_common::EventSender,
    bambooclaw_config::SupervisorConfig,
    futures::StreamExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    adapter::ChannelAdapter,
    error::AdapterError,
    health::{HealthState, HealthTracker},
};

/// Backoff and failure thresholds applied to every adapter.
#[derive(Debug, Clone)]
pub struct SupervisionSettings {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub doctor_timeout: Duration,
}

impl SupervisionSettings {
    #[must_use]
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            failure_threshold: config.failure_threshold,
            failure_window: Duration::from_secs(config.failure_window_secs),
            doctor_timeout: Duration::from_millis(config.doctor_timeout_ms),
        }
    }
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

/// Consecutive failures inside a sliding window.
struct FailureStreak {
    window: Duration,
    failures: VecDeque<Instant>,
}

impl FailureStreak {
    fn new(window: Duration) -> Self {
        Self {
            window,
            failures: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant) -> u32 {
        while self
            .failures
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            self.failures.pop_front();
        }
        self.failures.push_back(now);
        u32::try_from(self.failures.len()).unwrap_or(u32::MAX)
    }

    fn reset(&mut self) {
        self.failures.clear();
    }
}

/// Run until cancelled or until the channel goes offline.
pub(crate) async fn supervise(
    adapter: Arc<dyn ChannelAdapter>,
    health: Arc<HealthTracker>,
    events: EventSender,
    settings: SupervisionSettings,
    cancel: CancellationToken,
) {
    let name = adapter.name().to_string();
    let mut streak = FailureStreak::new(settings.failure_window);
    let initial = settings.backoff_initial.max(Duration::from_millis(1));
    let max_backoff = settings.backoff_max.max(initial);
    let mut backoff = initial;

    loop {
        let connected = tokio::select! {
            () = cancel.cancelled() => return,
            connected = adapter.connect() => connected,
        };

        let failure = match connected {
            Err(e) => e,
            Ok(()) => {
                health.transition(HealthState::Online, None);
                let mut stream = adapter.receive();
                let failure = loop {
                    let item = tokio::select! {
                        () = cancel.cancelled() => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(event)) => {
                            streak.reset();
                            backoff = initial;
                            health.transition(HealthState::Online, None);
                            let sent = tokio::select! {
                                () = cancel.cancelled() => return,
                                sent = events.send(event) => sent,
                            };
                            if sent.is_err() {
                                warn!(channel = %name, "event bus closed, stopping channel");
                                return;
                            }
                        },
                        Some(Err(e)) => break e,
                        None => break AdapterError::Disconnected,
                    }
                };
                drop(stream);
                if let Err(e) = adapter.disconnect().await {
                    debug!(channel = %name, error = %e, "disconnect after failure");
                }
                failure
            },
        };

        let count = streak.record(Instant::now());
        if count >= settings.failure_threshold {
            health.transition(HealthState::Offline, Some(failure.to_string()));
            warn!(
                channel = %name,
                failures = count,
                "channel offline; restart required"
            );
            return;
        }

        health.transition(HealthState::Degraded, Some(failure.to_string()));
        debug!(channel = %name, backoff_ms = backoff.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(backoff) => {},
        }
        backoff = backoff.saturating_mul(2).min(max_backoff);
    }
}
