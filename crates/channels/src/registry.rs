//! Owns channel configs and their running adapters.
//!
//! Each name has its own async lock, so operations on one channel are
//! serialized while unrelated channels keep running untouched.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use {
    bambooclaw_common::{EventSender, EventSource, Reply},
    bambooclaw_config::{ChannelConfig, ChannelKind},
    chrono::Utc,
    serde::Serialize,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    adapter::{AdapterFactory, ChannelAdapter, Delivery},
    error::{Error, Result},
    health::{HealthState, HealthStatus, HealthTracker, HealthTransition},
    supervise::{SupervisionSettings, supervise},
};

struct Runtime {
    adapter: Arc<dyn ChannelAdapter>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ChannelSlot {
    op_lock: tokio::sync::Mutex<()>,
    config: RwLock<ChannelConfig>,
    health: Arc<HealthTracker>,
    runtime: Mutex<Option<Runtime>>,
}

impl ChannelSlot {
    fn config(&self) -> ChannelConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn adapter(&self) -> Option<Arc<dyn ChannelAdapter>> {
        self.runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|rt| Arc::clone(&rt.adapter))
    }

    /// Whether a runtime exists and its supervision task is still alive.
    fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|rt| !rt.task.is_finished())
    }

    fn take_runtime(&self) -> Option<Runtime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Snapshot of one channel for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub running: bool,
    pub health: HealthStatus,
}

/// Result of a non-mutating health probe.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub running: bool,
    /// What the supervisor last recorded.
    pub supervised: HealthStatus,
    /// What the adapter reported when probed, if it is running.
    pub probe: Option<HealthStatus>,
    pub transitions: Vec<HealthTransition>,
}

struct RegistryInner {
    slots: RwLock<BTreeMap<String, Arc<ChannelSlot>>>,
    factory: Arc<dyn AdapterFactory>,
    events: EventSender,
    settings: SupervisionSettings,
}

/// Registry of configured channels. Cheap to clone.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        events: EventSender,
        settings: SupervisionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: RwLock::new(BTreeMap::new()),
                factory,
                events,
                settings,
            }),
        }
    }

    fn slot(&self, name: &str) -> Result<Arc<ChannelSlot>> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unknown(name))
    }

    fn slots(&self) -> Vec<(String, Arc<ChannelSlot>)> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Add a channel or replace the config of a stopped one.
    pub async fn configure(&self, config: ChannelConfig) -> Result<()> {
        let name = config.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::invalid_input("channel name must not be empty"));
        }
        if EventSource::RESERVED.contains(&name.as_str()) {
            return Err(Error::invalid_input(format!("\"{name}\" is a reserved name")));
        }

        let existing = {
            let mut slots = self.inner.slots.write().unwrap_or_else(|e| e.into_inner());
            match slots.get(&name) {
                Some(slot) => Some(Arc::clone(slot)),
                None => {
                    slots.insert(
                        name.clone(),
                        Arc::new(ChannelSlot {
                            op_lock: tokio::sync::Mutex::new(()),
                            config: RwLock::new(config.clone()),
                            health: Arc::new(HealthTracker::new(&name)),
                            runtime: Mutex::new(None),
                        }),
                    );
                    None
                },
            }
        };

        let Some(slot) = existing else {
            info!(channel = %name, kind = %config.kind, "channel configured");
            return Ok(());
        };
        let _guard = slot.op_lock.lock().await;
        if slot.is_running() {
            return Err(Error::Running { name });
        }
        *slot.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        info!(channel = %name, "channel reconfigured");
        Ok(())
    }

    /// Forget a stopped channel.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let _guard = slot.op_lock.lock().await;
        if slot.is_running() {
            return Err(Error::Running {
                name: name.to_string(),
            });
        }
        let _ = slot.take_runtime();
        self.inner
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        info!(channel = %name, "channel removed");
        Ok(())
    }

    /// Build the adapter and spawn its supervision task. Starting a running
    /// channel is a no-op.
    pub async fn start(&self, name: &str) -> Result<()> {
        let slot = self.slot(name)?;
        let _guard = slot.op_lock.lock().await;
        self.start_locked(name, &slot).await
    }

    async fn start_locked(&self, name: &str, slot: &Arc<ChannelSlot>) -> Result<()> {
        if slot.is_running() {
            debug!(channel = %name, "already running");
            return Ok(());
        }
        // A finished task from an earlier offline run is discarded here.
        let _ = slot.take_runtime();

        let config = slot.config();
        let adapter = match self.inner.factory.build(&config) {
            Ok(adapter) => adapter,
            Err(e) => {
                slot.health
                    .transition(HealthState::Offline, Some(e.to_string()));
                return Err(Error::adapter(name, e));
            },
        };

        slot.health.transition(HealthState::Connecting, None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            Arc::clone(&adapter),
            Arc::clone(&slot.health),
            self.inner.events.clone(),
            self.inner.settings.clone(),
            cancel.clone(),
        ));
        *slot.runtime.lock().unwrap_or_else(|e| e.into_inner()) = Some(Runtime {
            adapter,
            cancel,
            task,
        });
        info!(channel = %name, kind = %config.kind, "channel started");
        Ok(())
    }

    /// Stop a channel, waiting up to `grace` for its task to wind down.
    pub async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let slot = self.slot(name)?;
        let _guard = slot.op_lock.lock().await;
        if !self.stop_locked(name, &slot, grace).await {
            return Err(Error::NotRunning {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn stop_locked(&self, name: &str, slot: &Arc<ChannelSlot>, grace: Duration) -> bool {
        let Some(runtime) = slot.take_runtime() else {
            return false;
        };
        runtime.cancel.cancel();
        match tokio::time::timeout(grace, runtime.adapter.disconnect()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!(channel = %name, error = %e, "disconnect failed"),
            Err(_) => warn!(channel = %name, "disconnect timed out"),
        }
        let mut task = runtime.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(channel = %name, "supervision task did not stop in time, aborting");
            task.abort();
        }
        slot.health.transition(HealthState::Offline, None);
        info!(channel = %name, "channel stopped");
        true
    }

    /// Stop if running, then start again. The channel is `Connecting` when
    /// this returns.
    pub async fn restart(&self, name: &str, grace: Duration) -> Result<()> {
        let slot = self.slot(name)?;
        let _guard = slot.op_lock.lock().await;
        self.stop_locked(name, &slot, grace).await;
        self.start_locked(name, &slot).await
    }

    /// Start every enabled channel. Failures are logged and returned; they do
    /// not prevent the others from starting.
    pub async fn start_enabled(&self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for (name, slot) in self.slots() {
            if !slot.config().enabled {
                debug!(channel = %name, "channel disabled, not starting");
                continue;
            }
            if let Err(e) = self.start(&name).await {
                warn!(channel = %name, error = %e, "failed to start channel");
                failures.push((name, e));
            }
        }
        failures
    }

    /// Stop all running channels concurrently.
    pub async fn stop_all(&self, grace: Duration) {
        let stops = self.slots().into_iter().map(|(name, slot)| async move {
            let _guard = slot.op_lock.lock().await;
            self.stop_locked(&name, &slot, grace).await;
        });
        futures::future::join_all(stops).await;
    }

    /// All channels ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<ChannelSummary> {
        self.slots()
            .into_iter()
            .map(|(name, slot)| {
                let config = slot.config();
                ChannelSummary {
                    name,
                    kind: config.kind,
                    enabled: config.enabled,
                    running: slot.is_running(),
                    health: slot.health.status(),
                }
            })
            .collect()
    }

    /// Number of channels whose supervisor reports them online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.health.state() == HealthState::Online)
            .count()
    }

    /// Probe every channel without changing any state. A probe that exceeds
    /// the doctor timeout is reported as degraded.
    pub async fn doctor(&self) -> Vec<ChannelReport> {
        let timeout = self.inner.settings.doctor_timeout;
        let probes = self.slots().into_iter().map(|(name, slot)| async move {
            let config = slot.config();
            let adapter = slot.adapter().filter(|_| slot.is_running());
            let probe = match adapter {
                Some(adapter) => Some(
                    tokio::time::timeout(timeout, adapter.health())
                        .await
                        .unwrap_or_else(|_| HealthStatus {
                            state: HealthState::Degraded,
                            last_error: Some(format!(
                                "health probe timed out after {}ms",
                                timeout.as_millis()
                            )),
                            last_transition_at: Utc::now(),
                        }),
                ),
                None => None,
            };
            ChannelReport {
                name,
                kind: config.kind,
                enabled: config.enabled,
                running: probe.is_some(),
                supervised: slot.health.status(),
                probe,
                transitions: slot.health.transitions(),
            }
        });
        futures::future::join_all(probes).await
    }

    /// Hand a reply to the named channel's adapter.
    pub async fn send(&self, name: &str, reply: &Reply) -> Result<Delivery> {
        let slot = self.slot(name)?;
        let Some(adapter) = slot.adapter().filter(|_| slot.is_running()) else {
            return Err(Error::NotRunning {
                name: name.to_string(),
            });
        };
        if reply.is_overdue(Utc::now()) {
            debug!(channel = %name, event_id = %reply.event_id, "reply past its deadline, dropping");
            return Ok(Delivery::Rejected("delivery deadline passed".into()));
        }
        adapter
            .send(reply)
            .await
            .map_err(|e| Error::adapter(name, e))
    }

    /// Current supervisor-recorded health of one channel.
    pub fn health(&self, name: &str) -> Result<HealthStatus> {
        Ok(self.slot(name)?.health.status())
    }
}
