/// Config schema types (workspace, provider, gateway, security, channels,
/// cron, dispatch, supervisor).
use std::{fmt, path::PathBuf};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration. Every section has defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BambooConfig {
    pub workspace: WorkspaceConfig,
    pub provider: ProviderConfig,
    pub gateway: GatewayConfig,
    pub security: SecurityConfig,
    pub channels: Vec<ChannelConfig>,
    pub cron: CronConfig,
    pub dispatch: DispatchConfig,
    pub supervisor: SupervisorConfig,
}

impl BambooConfig {
    /// Look up a channel entry by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }
}

/// Filesystem root the agent is confined to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Defaults to `<data_dir>/workspace` when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Built-in agent that repeats its input. Useful for local testing.
    #[default]
    Echo,
    /// POST completions to an HTTP endpoint.
    Http,
}

/// The completion capability the dispatcher calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint: Option<String>,
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Hold the webhook request open until the dispatcher finishes.
    #[default]
    Sync,
    /// Answer 202 immediately with the event id.
    Ack,
}

/// HTTP ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub host: String,
    pub port: u16,
    /// Must be set to bind anything other than a loopback address.
    pub allow_public_bind: bool,
    /// Pre-shared setup code exchanged for a bearer token on `POST /pair`.
    /// Pairing is refused when unset.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub pairing_code: Option<Secret<String>>,
    pub reply_mode: ReplyMode,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            allow_public_bind: false,
            pairing_code: None,
            reply_mode: ReplyMode::Sync,
            request_timeout_secs: 30,
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Token, path, and network policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject path components starting with `.`.
    pub deny_dotfiles: bool,
    /// Glob patterns (`*` and `?`) matched against each path component.
    pub sensitive_patterns: Vec<String>,
    /// Components that are allowed even if they look sensitive.
    pub path_allowlist: Vec<String>,
    /// Outbound destinations: exact host, `*.suffix`, IP, or CIDR.
    pub egress_allowlist: Vec<String>,
    /// Lifetime of issued tokens. `None` means tokens never expire.
    pub token_ttl_secs: Option<u64>,
    /// Keep token digests in `<data_dir>/tokens.json` across restarts.
    pub persist_tokens: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            deny_dotfiles: true,
            sensitive_patterns: vec![
                "*.pem".into(),
                "*.key".into(),
                "id_rsa*".into(),
                "id_ed25519*".into(),
                "*.p12".into(),
            ],
            path_allowlist: Vec::new(),
            egress_allowlist: Vec::new(),
            token_ttl_secs: None,
            persist_tokens: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Request-driven: inbound arrives through the gateway.
    Webhook,
    /// Persistent: the adapter polls its endpoint for updates.
    LongPoll,
}

impl ChannelKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::LongPoll => "long_poll",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured messaging channel.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKind,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub credentials: Option<Secret<String>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl ChannelConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            credentials: None,
            enabled: true,
            endpoint: None,
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(Secret::new(credentials.into()));
        self
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|_| "[REDACTED]"),
            )
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

/// Scheduler settings plus jobs declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub jobs: Vec<CronJobEntry>,
    /// How long a fire waits for the dispatcher outcome before recording a
    /// timeout.
    pub outcome_timeout_secs: u64,
    /// Job creations allowed per `rate_limit_window_secs`.
    pub rate_limit_max: usize,
    pub rate_limit_window_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            outcome_timeout_secs: 300,
            rate_limit_max: 10,
            rate_limit_window_secs: 60,
        }
    }
}

/// A declarative job. Exactly one of `cron`, `every`, `at` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobEntry {
    /// Stable id; defaults to the name.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// Cron expression, 5 to 7 fields.
    #[serde(default)]
    pub cron: Option<String>,
    /// Fixed interval such as `30s`, `5m`, `2h`, `1d`.
    #[serde(default)]
    pub every: Option<String>,
    /// One-shot RFC 3339 timestamp.
    #[serde(default)]
    pub at: Option<String>,
    /// IANA timezone for cron expressions.
    #[serde(default)]
    pub tz: Option<String>,
    pub command: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl CronJobEntry {
    /// The id the scheduler stores this entry under.
    #[must_use]
    pub fn job_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub agent_timeout_secs: u64,
    pub queue_capacity: usize,
    /// Prior messages handed to the agent as context.
    pub history_limit: usize,
    /// Size of the diagnostic ring of dispatch records.
    pub record_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            agent_timeout_secs: 120,
            queue_capacity: 256,
            history_limit: 8,
            record_capacity: 256,
        }
    }
}

/// Lifecycle, heartbeat, and channel supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub heartbeat_interval_secs: u64,
    /// Defaults to `<data_dir>/state.json`.
    pub state_file: Option<PathBuf>,
    pub shutdown_grace_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failures within `failure_window_secs` before a channel
    /// goes offline.
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub doctor_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            state_file: None,
            shutdown_grace_secs: 5,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            failure_threshold: 3,
            failure_window_secs: 300,
            doctor_timeout_ms: 2_000,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout_secs() -> u64 {
    25
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: BambooConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert!(!cfg.gateway.allow_public_bind);
        assert_eq!(cfg.supervisor.failure_threshold, 3);
        assert!(cfg.channels.is_empty());
    }

    #[test]
    fn parses_channels_and_jobs() {
        let cfg: BambooConfig = toml::from_str(
            r#"
[[channels]]
name = "ops"
kind = "long_poll"
endpoint = "http://127.0.0.1:9000"
credentials = "s3cret"

[[cron.jobs]]
name = "digest"
every = "5m"
command = "summarize inbox"
"#,
        )
        .unwrap();
        let ops = cfg.channel("ops").unwrap();
        assert_eq!(ops.kind, ChannelKind::LongPoll);
        assert!(ops.enabled);
        assert_eq!(cfg.cron.jobs[0].job_id(), "digest");
    }

    #[test]
    fn channel_debug_redacts_credentials() {
        let cfg = ChannelConfig::new("ops", ChannelKind::Webhook).with_credentials("hunter2");
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("[REDACTED]"));
    }
}
