//! Lifecycle of the whole daemon.
//!
//! Components start in dependency order (security gate, channels, cron,
//! gateway, dispatcher) and stop in reverse. Every stop step is bounded by
//! the shutdown grace period and a failing step never blocks the rest.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    bambooclaw_channels::{ChannelRegistry, DefaultAdapterFactory, SupervisionSettings},
    bambooclaw_common::event_bus,
    bambooclaw_config::BambooConfig,
    bambooclaw_cron::{CronService, CronSettings, FileStore},
    bambooclaw_dispatch::{DispatchSettings, Dispatcher, InMemoryConversationStore, build_agent},
    bambooclaw_gateway::{GatewayServer, GatewayState},
    bambooclaw_security::SecurityGate,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

use crate::{
    error::{DaemonError, Result},
    heartbeat::Heartbeat,
};

/// Builds and starts every component from one config.
pub struct Supervisor {
    config: BambooConfig,
    data_dir: PathBuf,
}

/// Handles to a started daemon.
pub struct RunningDaemon {
    gate: Arc<SecurityGate>,
    channels: ChannelRegistry,
    cron: Arc<CronService>,
    dispatcher: Arc<Dispatcher>,
    gateway_addr: SocketAddr,
    grace: Duration,
    gateway: Stage,
    dispatch: Stage,
    heartbeat: Stage,
}

/// A spawned task plus the token that stops it.
struct Stage {
    name: &'static str,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Stage {
    async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => info!(component = self.name, "stopped"),
            Ok(Err(e)) => error!(component = self.name, error = %e, "task failed"),
            Err(_) => {
                warn!(component = self.name, "did not stop within grace period, aborting");
                task.abort();
            },
        }
    }
}

impl Supervisor {
    #[must_use]
    pub fn new(config: BambooConfig, data_dir: PathBuf) -> Self {
        Self { config, data_dir }
    }

    #[must_use]
    pub fn state_file(config: &BambooConfig, data_dir: &Path) -> PathBuf {
        config
            .supervisor
            .state_file
            .clone()
            .unwrap_or_else(|| data_dir.join("state.json"))
    }

    pub async fn start(self) -> Result<RunningDaemon> {
        let config = &self.config;
        let grace = Duration::from_secs(config.supervisor.shutdown_grace_secs);

        // Security gate.
        let workspace = config
            .workspace
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("workspace"));
        std::fs::create_dir_all(&workspace)
            .map_err(|e| DaemonError::startup("workspace", format!("{}: {e}", workspace.display())))?;
        let gate = Arc::new(
            SecurityGate::from_config(&config.security, &config.gateway, &self.data_dir)
                .with_workspace(workspace),
        );
        let (events, rx) = event_bus(config.dispatch.queue_capacity);

        // Channels.
        let channels = ChannelRegistry::new(
            Arc::new(DefaultAdapterFactory::new(Arc::clone(&gate))),
            events.clone(),
            SupervisionSettings::from_config(&config.supervisor),
        );
        for channel in &config.channels {
            if let Err(e) = channels.configure(channel.clone()).await {
                error!(channel = %channel.name, error = %e, "channel not configured");
            }
        }
        for (name, e) in channels.start_enabled().await {
            error!(channel = %name, error = %e, "channel failed to start");
        }

        // Cron.
        let store = Arc::new(FileStore::in_dir(&self.data_dir.join("cron")));
        let cron = CronService::new(store, events.clone(), CronSettings::from_config(&config.cron));
        if let Err(e) = cron.start().await {
            channels.stop_all(grace).await;
            return Err(DaemonError::startup("cron", e));
        }
        let report = cron.sync_from_config(&config.cron).await;
        for (id, reason) in &report.rejected {
            warn!(job_id = %id, reason = %reason, "config cron job rejected");
        }
        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "cron jobs synced from config"
        );

        // Gateway.
        let gateway_state = Arc::new(
            GatewayState::new(Arc::clone(&gate), events.clone(), &config.gateway)
                .with_channels(channels.clone()),
        );
        let server = match GatewayServer::bind(&config.gateway, gateway_state).await {
            Ok(server) => server,
            Err(e) => {
                cron.stop(grace).await;
                channels.stop_all(grace).await;
                return Err(DaemonError::startup("gateway", format!("{e:#}")));
            },
        };
        let gateway_addr = server
            .local_addr()
            .map_err(|e| DaemonError::startup("gateway", e))?;
        let gateway_cancel = CancellationToken::new();
        let gateway = Stage {
            name: "gateway",
            cancel: gateway_cancel.clone(),
            task: tokio::spawn(async move {
                if let Err(e) = server.serve(gateway_cancel).await {
                    error!(error = %format!("{e:#}"), "gateway server failed");
                }
            }),
        };

        // Dispatcher.
        let agent = match build_agent(&config.provider, Arc::clone(&gate)) {
            Ok(agent) => agent,
            Err(e) => {
                gateway.stop(grace).await;
                cron.stop(grace).await;
                channels.stop_all(grace).await;
                return Err(DaemonError::startup("dispatcher", format!("{e:#}")));
            },
        };
        let dispatcher = Arc::new(
            Dispatcher::new(
                agent,
                Arc::new(InMemoryConversationStore::default()),
                DispatchSettings::from_config(&config.dispatch),
            )
            .with_router(Arc::new(channels.clone())),
        );
        let dispatch_cancel = CancellationToken::new();
        let dispatch = Stage {
            name: "dispatcher",
            cancel: dispatch_cancel.clone(),
            task: tokio::spawn(Arc::clone(&dispatcher).run(rx, dispatch_cancel)),
        };

        // Heartbeat.
        let heartbeat = Heartbeat::new(
            Self::state_file(config, &self.data_dir),
            Duration::from_secs(config.supervisor.heartbeat_interval_secs),
            channels.clone(),
        )
        .with_cron(Arc::clone(&cron))
        .with_gateway_addr(gateway_addr.to_string());
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = Stage {
            name: "heartbeat",
            cancel: heartbeat_cancel.clone(),
            task: tokio::spawn(heartbeat.run(heartbeat_cancel)),
        };

        info!(
            gateway = %gateway_addr,
            channels = channels.list().len(),
            "daemon started"
        );
        Ok(RunningDaemon {
            gate,
            channels,
            cron,
            dispatcher,
            gateway_addr,
            grace,
            gateway,
            dispatch,
            heartbeat,
        })
    }
}

impl RunningDaemon {
    #[must_use]
    pub fn gateway_addr(&self) -> SocketAddr {
        self.gateway_addr
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    #[must_use]
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    #[must_use]
    pub fn cron(&self) -> &Arc<CronService> {
        &self.cron
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stop everything in reverse start order. The heartbeat goes last so the
    /// state file records the clean stop.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.dispatch.stop(self.grace).await;
        self.gateway.stop(self.grace).await;
        self.cron.stop(self.grace).await;
        self.channels.stop_all(self.grace).await;
        self.heartbeat.stop(self.grace).await;
        info!("daemon stopped");
    }

    /// Run until ctrl-c, then shut down.
    pub async fn run_until_signal(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        self.shutdown().await;
    }
}
