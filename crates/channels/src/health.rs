//! Per-channel health with a bounded transition log.

use std::{collections::VecDeque, fmt, sync::Mutex};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

const DEFAULT_LOG_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Connecting,
    Online,
    Degraded,
    Offline,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_transition_at: DateTime<Utc>,
}

impl HealthStatus {
    #[must_use]
    pub fn new(state: HealthState, last_error: Option<String>) -> Self {
        Self {
            state,
            last_error,
            last_transition_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthTransition {
    pub from: HealthState,
    pub to: HealthState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct TrackerInner {
    status: HealthStatus,
    log: VecDeque<HealthTransition>,
}

/// Health of one channel. Every transition is logged through `tracing` and
/// kept in a bounded ring for diagnostics.
pub struct HealthTracker {
    channel: String,
    capacity: usize,
    inner: Mutex<TrackerInner>,
}

impl HealthTracker {
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self::with_capacity(channel, DEFAULT_LOG_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(channel: impl Into<String>, capacity: usize) -> Self {
        Self {
            channel: channel.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(TrackerInner {
                status: HealthStatus::new(HealthState::Offline, None),
                log: VecDeque::new(),
            }),
        }
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status
            .clone()
    }

    #[must_use]
    pub fn state(&self) -> HealthState {
        self.status().state
    }

    /// Move to `to`. Repeating the current state with the same error is a
    /// no-op.
    pub fn transition(&self, to: HealthState, error: Option<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let from = inner.status.state;
        if from == to && inner.status.last_error == error {
            return;
        }
        let now = Utc::now();
        inner.status = HealthStatus {
            state: to,
            last_error: error.clone(),
            last_transition_at: now,
        };
        if inner.log.len() == self.capacity {
            inner.log.pop_front();
        }
        inner.log.push_back(HealthTransition {
            from,
            to,
            at: now,
            error: error.clone(),
        });
        drop(inner);

        match to {
            HealthState::Degraded | HealthState::Offline if error.is_some() => warn!(
                channel = %self.channel,
                %from,
                %to,
                error = error.as_deref().unwrap_or_default(),
                "channel health changed"
            ),
            _ => info!(channel = %self.channel, %from, %to, "channel health changed"),
        }
    }

    /// Transition log, oldest first.
    #[must_use]
    pub fn transitions(&self) -> Vec<HealthTransition> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .log
            .iter()
            .cloned()
            .collect()
    }
}
