mod channel_commands;
mod config_commands;
mod cron_commands;
mod doctor_commands;
mod paint;
mod status_commands;

use std::path::PathBuf;

use {
    anyhow::Result,
    bambooclaw_daemon::Supervisor,
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::{
    channel_commands::ChannelAction, config_commands::ConfigAction, cron_commands::CronAction,
};

#[derive(Parser)]
#[command(
    name = "bambooclaw",
    version,
    about = "bambooclaw: channels, cron, and a paired webhook gateway in one daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Gateway host to bind (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Gateway port (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Custom config directory (overrides default ~/.bambooclaw/).
    #[arg(long, global = true, env = "BAMBOOCLAW_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// Custom data directory (overrides default ~/.bambooclaw/).
    #[arg(long, global = true, env = "BAMBOOCLAW_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default when no subcommand is provided).
    Daemon,
    /// Check config, channels, cron jobs, and the last heartbeat.
    Doctor,
    /// Show the state recorded by the running daemon.
    Status {
        /// Print the raw state file as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Scheduled job management.
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
    /// Channel management.
    Channel {
        #[command(subcommand)]
        action: ChannelAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

async fn run_daemon(bind: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = config_commands::load_validated()?;
    if let Some(bind) = bind {
        config.gateway.host = bind;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let data_dir = bambooclaw_config::ensure_data_dir()?;
    let daemon = Supervisor::new(config, data_dir).start().await?;
    info!(gateway = %daemon.gateway_addr(), "ready, press ctrl-c to stop");
    daemon.run_until_signal().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    // Directory overrides apply before any config is read.
    if let Some(ref dir) = cli.config_dir {
        bambooclaw_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        bambooclaw_config::set_data_dir(dir.clone());
    }

    match cli.command {
        None | Some(Commands::Daemon) => {
            info!(version = env!("CARGO_PKG_VERSION"), "bambooclaw starting");
            run_daemon(cli.bind, cli.port).await
        },
        Some(Commands::Doctor) => doctor_commands::handle_doctor().await,
        Some(Commands::Status { json }) => status_commands::handle_status(json),
        Some(Commands::Config { action }) => config_commands::handle_config(action),
        Some(Commands::Cron { action }) => cron_commands::handle_cron(action).await,
        Some(Commands::Channel { action }) => channel_commands::handle_channels(action),
    }
}
