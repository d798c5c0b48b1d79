//! CLI subcommands for channels.

use {
    anyhow::Result,
    bambooclaw_config::ChannelConfig,
    bambooclaw_daemon::{DaemonState, Supervisor, read_state},
    chrono::Utc,
    clap::Subcommand,
};

#[derive(Subcommand)]
pub enum ChannelAction {
    /// List configured channels with the health last recorded by the daemon.
    List,
}

pub fn handle_channels(action: ChannelAction) -> Result<()> {
    match action {
        ChannelAction::List => {
            let config = crate::config_commands::load_validated()?;
            let state_file = Supervisor::state_file(&config, &bambooclaw_config::data_dir());
            // Health is only meaningful while the daemon is alive.
            let state = read_state(&state_file)?
                .filter(|s| s.running && !s.is_stale(Utc::now()));

            if config.channels.is_empty() {
                println!("No channels configured.");
                return Ok(());
            }
            for channel in &config.channels {
                println!("{}", channel_line(channel, state.as_ref()));
            }
            Ok(())
        },
    }
}

fn channel_line(channel: &ChannelConfig, state: Option<&DaemonState>) -> String {
    let health = state
        .and_then(|s| s.channels.iter().find(|c| c.name == channel.name))
        .map(|c| match &c.last_error {
            Some(err) => format!("{} ({err})", c.state.as_str()),
            None => c.state.as_str().to_string(),
        })
        .unwrap_or_else(|| "-".into());
    format!(
        "{:<16} {:<9} {:<9} {:<40} {health}",
        channel.name,
        channel.kind.as_str(),
        if channel.enabled { "enabled" } else { "disabled" },
        channel.endpoint.as_deref().unwrap_or("-"),
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        bambooclaw_channels::HealthState,
        bambooclaw_config::ChannelKind,
        bambooclaw_daemon::ChannelState,
    };

    #[test]
    fn line_includes_recorded_health() {
        let now = Utc::now();
        let state = DaemonState {
            pid: 1,
            version: "0".into(),
            running: true,
            started_at: now,
            uptime_secs: 0,
            active_channels: 0,
            channels: vec![ChannelState {
                name: "poller".into(),
                state: HealthState::Degraded,
                last_error: Some("timeout".into()),
            }],
            last_cron_success_at: None,
            gateway_addr: None,
            heartbeat_interval_secs: 30,
            written_at: now,
        };
        let channel = ChannelConfig::new("poller", ChannelKind::LongPoll)
            .with_endpoint("https://chat.example.com/updates");

        let line = channel_line(&channel, Some(&state));
        assert!(line.contains("degraded (timeout)"));
        assert!(line.contains("https://chat.example.com/updates"));

        let offline = channel_line(&channel, None);
        assert!(offline.trim_end().ends_with('-'));
    }
}
