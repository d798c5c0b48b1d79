//! The state file: a JSON snapshot of the running daemon, rewritten every
//! heartbeat and read back by `bambooclaw status`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    bambooclaw_channels::{ChannelRegistry, HealthState},
    bambooclaw_cron::CronService,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub name: String,
    pub state: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub pid: u32,
    pub version: String,
    /// `false` once the daemon has shut down cleanly.
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub active_channels: usize,
    pub channels: Vec<ChannelState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cron_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_addr: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub written_at: DateTime<Utc>,
}

impl DaemonState {
    /// A running daemon that missed three heartbeats is presumed dead.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let allowed = i64::try_from(self.heartbeat_interval_secs.saturating_mul(3)).unwrap_or(i64::MAX);
        (now - self.written_at).num_seconds() > allowed
    }
}

/// Replace `path` atomically with `state`.
pub fn write_state(path: &Path, state: &DaemonState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DaemonError::state_io(parent, e))?;
    }
    let json = serde_json::to_vec_pretty(state).map_err(|source| DaemonError::StateFormat {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| DaemonError::state_io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| DaemonError::state_io(path, e))
}

/// `Ok(None)` when no daemon has ever written the file.
pub fn read_state(path: &Path) -> Result<Option<DaemonState>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DaemonError::state_io(path, e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| DaemonError::StateFormat {
            path: path.to_path_buf(),
            source,
        })
}

pub struct Heartbeat {
    path: PathBuf,
    interval: Duration,
    started_at: DateTime<Utc>,
    channels: ChannelRegistry,
    cron: Option<Arc<CronService>>,
    gateway_addr: Option<String>,
}

impl Heartbeat {
    #[must_use]
    pub fn new(path: PathBuf, interval: Duration, channels: ChannelRegistry) -> Self {
        Self {
            path,
            interval: interval.max(Duration::from_secs(1)),
            started_at: Utc::now(),
            channels,
            cron: None,
            gateway_addr: None,
        }
    }

    #[must_use]
    pub fn with_cron(mut self, cron: Arc<CronService>) -> Self {
        self.cron = Some(cron);
        self
    }

    #[must_use]
    pub fn with_gateway_addr(mut self, addr: impl Into<String>) -> Self {
        self.gateway_addr = Some(addr.into());
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self, running: bool) -> DaemonState {
        let now = Utc::now();
        let summaries = self.channels.list();
        let last_cron_success_at = match &self.cron {
            Some(cron) => cron
                .status()
                .await
                .last_success_at_ms
                .and_then(|ms| i64::try_from(ms).ok())
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            None => None,
        };
        DaemonState {
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            running,
            started_at: self.started_at,
            uptime_secs: u64::try_from((now - self.started_at).num_seconds()).unwrap_or(0),
            active_channels: summaries
                .iter()
                .filter(|c| c.health.state == HealthState::Online)
                .count(),
            channels: summaries
                .into_iter()
                .map(|c| ChannelState {
                    name: c.name,
                    state: c.health.state,
                    last_error: c.health.last_error,
                })
                .collect(),
            last_cron_success_at,
            gateway_addr: self.gateway_addr.clone(),
            heartbeat_interval_secs: self.interval.as_secs(),
            written_at: now,
        }
    }

    /// Write one snapshot now.
    pub async fn beat(&self, running: bool) -> Result<DaemonState> {
        let state = self.snapshot(running).await;
        write_state(&self.path, &state)?;
        debug!(path = %self.path.display(), channels = state.active_channels, "heartbeat written");
        Ok(state)
    }

    /// Beat every interval until cancelled, then record a clean stop.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.beat(true).await {
                        warn!(error = %e, "heartbeat write failed");
                    }
                },
            }
        }
        if let Err(e) = self.beat(false).await {
            warn!(error = %e, "final heartbeat write failed");
        }
    }
}
