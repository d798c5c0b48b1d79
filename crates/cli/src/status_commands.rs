//! `bambooclaw status`: reads the state file written by the daemon heartbeat.

use {
    anyhow::Result,
    bambooclaw_daemon::{DaemonState, Supervisor, read_state},
    chrono::{DateTime, Utc},
};

use crate::paint::{Tone, paint};

/// How the recorded state should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Stopped,
    /// Marked running, but the heartbeat stopped arriving.
    Stale,
}

impl Liveness {
    #[must_use]
    pub fn of(state: &DaemonState, now: DateTime<Utc>) -> Self {
        if !state.running {
            Self::Stopped
        } else if state.is_stale(now) {
            Self::Stale
        } else {
            Self::Running
        }
    }

    fn render(self) -> String {
        match self {
            Self::Running => paint(Tone::Good, "running"),
            Self::Stopped => paint(Tone::Caution, "stopped"),
            Self::Stale => paint(Tone::Bad, "stale (no heartbeat)"),
        }
    }
}

pub fn handle_status(json: bool) -> Result<()> {
    let config = crate::config_commands::load_validated()?;
    let data_dir = bambooclaw_config::data_dir();
    let path = Supervisor::state_file(&config, &data_dir);

    let Some(state) = read_state(&path)? else {
        eprintln!("No daemon state at {}; the daemon has not run yet.", path.display());
        std::process::exit(1);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let liveness = Liveness::of(&state, Utc::now());
    for line in render(&state, liveness) {
        println!("{line}");
    }
    if liveness != Liveness::Running {
        std::process::exit(1);
    }
    Ok(())
}

fn render(state: &DaemonState, liveness: Liveness) -> Vec<String> {
    let mut lines = vec![
        format!(
            "{}  pid {}",
            paint(Tone::Strong, format!("bambooclaw {}", state.version)),
            state.pid
        ),
        format!("  status:      {}", liveness.render()),
        format!("  started:     {}", state.started_at.to_rfc3339()),
        format!("  uptime:      {}s", state.uptime_secs),
        format!("  last beat:   {}", state.written_at.to_rfc3339()),
    ];
    if let Some(addr) = &state.gateway_addr {
        lines.push(format!("  gateway:     http://{addr}"));
    }
    lines.push(match state.last_cron_success_at {
        Some(at) => format!("  cron:        last success {}", at.to_rfc3339()),
        None => "  cron:        no successful run yet".to_string(),
    });
    lines.push(format!(
        "  channels:    {}/{} online",
        state.active_channels,
        state.channels.len()
    ));
    for channel in &state.channels {
        let mut line = format!("    {:<16} {}", channel.name, channel.state.as_str());
        if let Some(err) = &channel.last_error {
            line.push_str(&format!("  ({err})"));
        }
        lines.push(line);
    }
    lines
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        bambooclaw_channels::HealthState,
        bambooclaw_daemon::ChannelState,
    };

    fn state(running: bool, age_secs: i64) -> DaemonState {
        let now = Utc::now();
        DaemonState {
            pid: 42,
            version: "0.1.0".into(),
            running,
            started_at: now - chrono::Duration::seconds(600),
            uptime_secs: 600,
            active_channels: 1,
            channels: vec![
                ChannelState {
                    name: "hooks".into(),
                    state: HealthState::Online,
                    last_error: None,
                },
                ChannelState {
                    name: "poller".into(),
                    state: HealthState::Degraded,
                    last_error: Some("connection refused".into()),
                },
            ],
            last_cron_success_at: None,
            gateway_addr: Some("127.0.0.1:8787".into()),
            heartbeat_interval_secs: 30,
            written_at: now - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn liveness_reflects_flag_and_age() {
        let now = Utc::now();
        assert_eq!(Liveness::of(&state(true, 5), now), Liveness::Running);
        assert_eq!(Liveness::of(&state(true, 300), now), Liveness::Stale);
        assert_eq!(Liveness::of(&state(false, 300), now), Liveness::Stopped);
    }

    #[test]
    fn render_lists_channels_with_errors() {
        let lines = render(&state(true, 5), Liveness::Running);
        assert!(lines.iter().any(|l| l.contains("1/2 online")));
        assert!(lines.iter().any(|l| l.contains("poller") && l.contains("connection refused")));
        assert!(lines.iter().any(|l| l.contains("http://127.0.0.1:8787")));
    }
}
