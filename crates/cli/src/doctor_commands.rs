//! `bambooclaw doctor`: config validation plus a read-only audit of every
//! component.
//!
//! Prints a structured report with `[ok]`, `[warn]`, `[fail]`, `[skip]`, or
//! `[info]` per item. Nothing is started and no file is written.

use std::{path::Path, sync::Arc};

use {
    anyhow::Result,
    bambooclaw_common::event_bus,
    bambooclaw_config::{
        BambooConfig, ChannelKind, ProviderKind, Severity, ValidationResult, validate,
    },
    bambooclaw_cron::{CronService, CronSettings, CronStore, FileStore, InMemoryStore, JobState},
    bambooclaw_daemon::{Supervisor, read_state},
    bambooclaw_security::SecurityGate,
    chrono::Utc,
};

use crate::{
    paint::{Tone, paint},
    status_commands::Liveness,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Warn,
    Fail,
    Skip,
    Info,
}

impl Status {
    fn tag(self) -> String {
        let (tone, label) = match self {
            Self::Ok => (Tone::Good, "ok"),
            Self::Warn => (Tone::Caution, "warn"),
            Self::Fail => (Tone::Bad, "fail"),
            Self::Skip => (Tone::Muted, "skip"),
            Self::Info => (Tone::Note, "info"),
        };
        format!("[{}]", paint(tone, label))
    }
}

impl From<Severity> for Status {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Error => Self::Fail,
            Severity::Warning => Self::Warn,
            Severity::Info => Self::Info,
        }
    }
}

struct CheckItem {
    status: Status,
    message: String,
}

/// One component's findings.
struct Section {
    title: String,
    items: Vec<CheckItem>,
}

impl Section {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, status: Status, message: impl Into<String>) {
        self.items.push(CheckItem {
            status,
            message: message.into(),
        });
    }

    fn has(&self, status: Status) -> bool {
        self.items.iter().any(|i| i.status == status)
    }

    fn count(&self, status: Status) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

fn render_report(sections: &[Section]) -> Vec<String> {
    let mut lines = vec![paint(Tone::Strong, "bambooclaw doctor"), String::new()];
    for section in sections {
        lines.push(paint(Tone::Strong, &section.title));
        lines.extend(
            section
                .items
                .iter()
                .map(|item| format!("  {} {}", item.status.tag(), item.message)),
        );
        lines.push(String::new());
    }
    let errors: usize = sections.iter().map(|s| s.count(Status::Fail)).sum();
    let warnings: usize = sections.iter().map(|s| s.count(Status::Warn)).sum();
    lines.push(format!(
        "{} {errors} error(s), {warnings} warning(s)",
        paint(Tone::Strong, "summary:")
    ));
    lines
}

pub async fn handle_doctor() -> Result<()> {
    let data_dir = bambooclaw_config::data_dir();

    let validation = validate(None);
    let mut sections = vec![check_config(&validation)];

    // The remaining checks need a parsed config.
    let config = match (&validation.config_path, validation.has_errors()) {
        (_, true) => None,
        (Some(path), false) => bambooclaw_config::load_config(path).ok(),
        (None, false) => Some(BambooConfig::default()),
    };

    match config {
        Some(config) => {
            let gate = SecurityGate::from_config(&config.security, &config.gateway, &data_dir);
            sections.push(check_security(&config, &gate, &data_dir));
            sections.push(check_provider(&config, &gate));
            sections.push(check_channels(&config, &gate));
            sections.push(check_cron(&config, &data_dir).await);
            sections.push(check_daemon(&config, &data_dir));
        },
        None => {
            let mut skipped = Section::new("Components");
            skipped.push(Status::Skip, "config has errors; component checks skipped");
            sections.push(skipped);
        },
    }

    for line in render_report(&sections) {
        eprintln!("{line}");
    }
    if sections.iter().any(|s| s.has(Status::Fail)) {
        std::process::exit(1);
    }

    Ok(())
}

fn check_config(result: &ValidationResult) -> Section {
    let label = result
        .config_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "defaults".into());
    let mut section = Section::new(format!("Config ({label})"));

    let syntax_errors: Vec<_> = result
        .diagnostics
        .iter()
        .filter(|d| d.category == "syntax" && d.severity == Severity::Error)
        .collect();
    if !syntax_errors.is_empty() {
        for d in syntax_errors {
            section.push(Status::Fail, format!("syntax: {}", d.message));
        }
        return section;
    }
    section.push(Status::Ok, "Syntax valid");

    for d in &result.diagnostics {
        if d.category == "file-ref" && d.severity == Severity::Info {
            section.push(Status::Info, d.message.clone());
            continue;
        }
        let msg = if d.path.is_empty() {
            d.message.clone()
        } else {
            format!("{}: {}", d.path, d.message)
        };
        section.push(d.severity.into(), msg);
    }

    if !result.has_errors() {
        section.push(Status::Ok, "No errors");
    }
    section
}

fn check_security(config: &BambooConfig, gate: &SecurityGate, data_dir: &Path) -> Section {
    let mut section = Section::new("Security");

    let host = &config.gateway.host;
    match gate.check_bind(host) {
        Ok(()) if bambooclaw_security::is_loopback(host) => {
            section.push(Status::Ok, format!("Gateway binds to loopback ({host})"));
        },
        Ok(()) => section.push(
            Status::Warn,
            format!("Gateway binds to {host}; public bind is explicitly allowed"),
        ),
        Err(e) => section.push(Status::Fail, e.to_string()),
    }

    if gate.pairing_configured() {
        section.push(Status::Ok, "Pairing code configured");
    } else {
        section.push(
            Status::Warn,
            "No gateway.pairing_code; clients cannot pair and /webhook rejects every request",
        );
    }

    if config.security.egress_allowlist.is_empty() {
        section.push(Status::Info, "Egress allowlist is empty; all outbound HTTP is denied");
    } else {
        section.push(
            Status::Ok,
            format!(
                "Egress allowed to: {}",
                config.security.egress_allowlist.join(", ")
            ),
        );
    }

    if config.security.persist_tokens {
        let path = data_dir.join("tokens.json");
        if path.exists() {
            section.push(Status::Info, format!("Token digests persisted at {}", path.display()));
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = std::fs::metadata(&path)
                    && meta.permissions().mode() & 0o077 != 0
                {
                    section.push(
                        Status::Warn,
                        format!("{} is readable by other users (chmod 600)", path.display()),
                    );
                }
            }
        } else {
            section.push(Status::Info, "Token persistence enabled; no tokens issued yet");
        }
    } else {
        section.push(Status::Info, "Tokens are kept in memory; clients re-pair after restart");
    }

    section
}

fn check_provider(config: &BambooConfig, gate: &SecurityGate) -> Section {
    let mut section = Section::new("Agent provider");
    let provider = &config.provider;
    match provider.kind {
        ProviderKind::Echo => section.push(Status::Info, "Echo agent (replies mirror the input)"),
        ProviderKind::Http => match &provider.endpoint {
            None => section.push(Status::Fail, "provider.kind = http needs provider.endpoint"),
            Some(endpoint) => match gate.require_egress(endpoint) {
                Ok(()) => section.push(Status::Ok, format!("HTTP agent at {endpoint}")),
                Err(e) => section.push(
                    Status::Fail,
                    format!("{endpoint}: {e}; add its host to security.egress_allowlist"),
                ),
            },
        },
    }
    section
}

fn check_channels(config: &BambooConfig, gate: &SecurityGate) -> Section {
    let mut section = Section::new("Channels");
    if config.channels.is_empty() {
        section.push(Status::Info, "No channels configured");
        return section;
    }

    for channel in &config.channels {
        let name = &channel.name;
        if !channel.enabled {
            section.push(Status::Skip, format!("{name}: disabled"));
            continue;
        }
        match (&channel.endpoint, channel.kind) {
            (None, ChannelKind::Webhook) => section.push(
                Status::Info,
                format!("{name}: no endpoint; replies are kept in the outbox"),
            ),
            (None, ChannelKind::LongPoll) => section.push(
                Status::Fail,
                format!("{name}: long_poll channels need an endpoint"),
            ),
            (Some(endpoint), kind) => match gate.require_egress(endpoint) {
                Ok(()) => {
                    section.push(Status::Ok, format!("{name}: {} -> {endpoint}", kind.as_str()));
                },
                Err(e) => section.push(Status::Fail, format!("{name}: {e}")),
            },
        }
    }
    section
}

async fn check_cron(config: &BambooConfig, data_dir: &Path) -> Section {
    let mut section = Section::new("Cron");

    // Apply the declared jobs to a throwaway in-memory scheduler to see
    // which ones would be rejected.
    if !config.cron.jobs.is_empty() {
        let (events, _rx) = event_bus(1);
        let probe = CronService::new(
            Arc::new(InMemoryStore::new()),
            events,
            CronSettings::from_config(&config.cron),
        );
        let report = probe.sync_from_config(&config.cron).await;
        if !report.added.is_empty() {
            section.push(
                Status::Ok,
                format!("{} job(s) declared in config", report.added.len()),
            );
        }
        for (id, reason) in &report.rejected {
            section.push(Status::Fail, format!("cron.jobs {id}: {reason}"));
        }
    }

    let store = FileStore::in_dir(&data_dir.join("cron"));
    match store.load_jobs().await {
        Ok(jobs) if jobs.is_empty() => section.push(Status::Info, "No persisted jobs"),
        Ok(jobs) => {
            let count = |state| jobs.iter().filter(|j| j.state == state).count();
            section.push(
                Status::Info,
                format!(
                    "{} persisted job(s): {} active, {} paused, {} completed, {} failed",
                    jobs.len(),
                    count(JobState::Active),
                    count(JobState::Paused),
                    count(JobState::Completed),
                    count(JobState::Failed),
                ),
            );
            for job in jobs.iter().filter(|j| j.state == JobState::Failed) {
                section.push(
                    Status::Warn,
                    format!("{} ({}): schedule can no longer fire", job.id, job.name),
                );
            }
        },
        Err(e) => section.push(
            Status::Fail,
            format!("{}: {e}", store.jobs_path().display()),
        ),
    }

    if !section.has(Status::Fail) && config.cron.jobs.is_empty() {
        section.push(Status::Ok, "No config-declared jobs");
    }
    section
}

fn check_daemon(config: &BambooConfig, data_dir: &Path) -> Section {
    let mut section = Section::new("Daemon");
    let path = Supervisor::state_file(config, data_dir);
    match read_state(&path) {
        Ok(None) => section.push(Status::Info, "No heartbeat recorded yet"),
        Ok(Some(state)) => {
            let written = state.written_at.to_rfc3339();
            match Liveness::of(&state, Utc::now()) {
                Liveness::Running => section.push(
                    Status::Ok,
                    format!(
                        "Running (pid {}), last heartbeat {written}, {}/{} channels online",
                        state.pid,
                        state.active_channels,
                        state.channels.len()
                    ),
                ),
                Liveness::Stopped => {
                    section.push(Status::Info, format!("Stopped cleanly at {written}"));
                },
                Liveness::Stale => section.push(
                    Status::Warn,
                    format!(
                        "Last heartbeat {written} is stale; pid {} probably exited uncleanly",
                        state.pid
                    ),
                ),
            }
            for channel in state.channels.iter().filter(|c| c.last_error.is_some()) {
                section.push(
                    Status::Warn,
                    format!(
                        "{}: {} ({})",
                        channel.name,
                        channel.state.as_str(),
                        channel.last_error.as_deref().unwrap_or_default()
                    ),
                );
            }
        },
        Err(e) => section.push(Status::Warn, e.to_string()),
    }
    section
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        bambooclaw_config::{ChannelConfig, CronJobEntry, GatewayConfig, SecurityConfig},
        tempfile::TempDir,
    };

    #[test]
    fn report_summary_counts_failures_and_warnings() {
        let mut first = Section::new("First");
        first.push(Status::Fail, "broken");
        first.push(Status::Warn, "shaky");
        let mut second = Section::new("Second");
        second.push(Status::Fail, "also broken");
        second.push(Status::Ok, "fine");

        let lines = render_report(&[first, second]);
        assert!(lines.last().unwrap().ends_with("2 error(s), 1 warning(s)"));
        assert!(lines.iter().any(|l| l.contains("fine")));
    }

    fn gate(config: &BambooConfig) -> SecurityGate {
        SecurityGate::from_config(&config.security, &config.gateway, Path::new("/nonexistent"))
    }

    #[test]
    fn public_bind_without_opt_in_fails() {
        let config = BambooConfig {
            gateway: GatewayConfig {
                host: "0.0.0.0".into(),
                ..GatewayConfig::default()
            },
            ..BambooConfig::default()
        };
        let section = check_security(&config, &gate(&config), Path::new("/nonexistent"));
        assert!(section.has(Status::Fail));
    }

    #[test]
    fn channel_endpoints_must_pass_egress() {
        let mut config = BambooConfig {
            security: SecurityConfig {
                egress_allowlist: vec!["hooks.example.com".into()],
                ..SecurityConfig::default()
            },
            ..BambooConfig::default()
        };
        config.channels = vec![
            ChannelConfig::new("ok", ChannelKind::Webhook)
                .with_endpoint("https://hooks.example.com/out"),
            ChannelConfig::new("blocked", ChannelKind::Webhook)
                .with_endpoint("https://evil.example.net/out"),
            ChannelConfig::new("poller", ChannelKind::LongPoll),
        ];
        let section = check_channels(&config, &gate(&config));
        let fails: Vec<_> = section
            .items
            .iter()
            .filter(|i| i.status == Status::Fail)
            .map(|i| i.message.as_str())
            .collect();
        assert_eq!(fails.len(), 2);
        assert!(fails.iter().any(|m| m.starts_with("blocked")));
        assert!(fails.iter().any(|m| m.starts_with("poller")));
    }

    #[test]
    fn http_provider_without_endpoint_fails() {
        let mut config = BambooConfig::default();
        config.provider.kind = ProviderKind::Http;
        assert!(check_provider(&config, &gate(&config)).has(Status::Fail));
    }

    #[tokio::test]
    async fn rejected_config_jobs_are_reported_without_touching_disk() {
        let tmp = TempDir::new().unwrap();
        let mut config = BambooConfig::default();
        config.cron.jobs.push(CronJobEntry {
            id: Some("bad".into()),
            name: "bad".into(),
            cron: Some("61 * * * *".into()),
            every: None,
            at: None,
            tz: None,
            command: "x".into(),
            enabled: true,
        });

        let section = check_cron(&config, tmp.path()).await;
        assert!(
            section
                .items
                .iter()
                .any(|i| i.status == Status::Fail && i.message.contains("bad"))
        );
        assert!(!tmp.path().join("cron").exists());
    }

    #[test]
    fn missing_heartbeat_is_informational() {
        let tmp = TempDir::new().unwrap();
        let section = check_daemon(&BambooConfig::default(), tmp.path());
        assert_eq!(section.items.len(), 1);
        assert_eq!(section.items[0].status, Status::Info);
    }
}
