//! Configuration validation engine.
//!
//! Validates configuration files against the known schema, detects
//! unknown/misspelled fields, and reports semantic and security problems.
//! Validation never mutates anything; callers decide whether to apply.

use std::{
    collections::{BTreeMap, HashSet},
    net::IpAddr,
    path::{Path, PathBuf},
};

use bambooclaw_common::EventSource;

use crate::{
    env_subst::{substitute_env, unresolved_placeholders},
    loader::{ConfigFormat, find_config_file, parse_config_value},
    schema::{BambooConfig, ChannelKind, ProviderKind},
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "security",
    /// "channel", "cron", "env", "file-ref", "value"
    pub category: &'static str,
    /// Dotted path, e.g. "gateway.hots"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

/// Expected shape of the configuration tree, used to flag unknown keys.
enum Shape {
    Table(BTreeMap<&'static str, Shape>),
    List(Box<Shape>),
    Value,
}

fn scalars(keys: &[&'static str]) -> BTreeMap<&'static str, Shape> {
    keys.iter().map(|k| (*k, Shape::Value)).collect()
}

fn table(keys: &[&'static str]) -> Shape {
    Shape::Table(scalars(keys))
}

/// Mirror of every field in `schema.rs`.
fn config_shape() -> Shape {
    use Shape::{List, Table};

    let cron_job = table(&["id", "name", "cron", "every", "at", "tz", "command", "enabled"]);
    let mut cron = scalars(&["outcome_timeout_secs", "rate_limit_max", "rate_limit_window_secs"]);
    cron.insert("jobs", List(Box::new(cron_job)));

    Table(BTreeMap::from([
        ("workspace", table(&["path"])),
        ("provider", table(&["kind", "endpoint", "api_key", "model"])),
        (
            "gateway",
            table(&[
                "host",
                "port",
                "allow_public_bind",
                "pairing_code",
                "reply_mode",
                "request_timeout_secs",
                "max_body_bytes",
            ]),
        ),
        (
            "security",
            table(&[
                "deny_dotfiles",
                "sensitive_patterns",
                "path_allowlist",
                "egress_allowlist",
                "token_ttl_secs",
                "persist_tokens",
            ]),
        ),
        (
            "channels",
            List(Box::new(table(&[
                "name",
                "kind",
                "credentials",
                "enabled",
                "endpoint",
                "poll_timeout_secs",
            ]))),
        ),
        ("cron", Table(cron)),
        (
            "dispatch",
            table(&[
                "agent_timeout_secs",
                "queue_capacity",
                "history_limit",
                "record_capacity",
            ]),
        ),
        (
            "supervisor",
            table(&[
                "heartbeat_interval_secs",
                "state_file",
                "shutdown_grace_secs",
                "backoff_initial_ms",
                "backoff_max_ms",
                "failure_threshold",
                "failure_window_secs",
                "doctor_timeout_ms",
            ]),
        ),
    ]))
}

/// Edit distance where swapping two adjacent chars counts as one edit.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut d = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    d[0] = (0..=b.len()).collect();
    for i in 1..=a.len() {
        d[i][0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut best = (d[i - 1][j] + 1)
                .min(d[i][j - 1] + 1)
                .min(d[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                best = best.min(d[i - 2][j - 2] + 1);
            }
            d[i][j] = best;
        }
    }
    d[a.len()][b.len()]
}

/// The known key a typo most likely meant. Ties go to the first key in
/// sorted order.
fn closest_key<'a>(typo: &str, known: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let budget = (typo.chars().count() / 3).clamp(1, 3);
    known
        .map(|k| (edit_distance(typo, k), k))
        .filter(|(d, _)| (1..=budget).contains(d))
        .min()
        .map(|(_, k)| k)
}


/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path.map(Path::to_path_buf).or_else(find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let format = match ConfigFormat::from_path(&actual_path) {
        Ok(format) => format,
        Err(e) => {
            return ValidationResult {
                diagnostics: vec![Diagnostic::new(Severity::Error, "syntax", "", e.to_string())],
                config_path: Some(actual_path),
            };
        },
    };

    match std::fs::read_to_string(&actual_path) {
        Ok(content) => {
            let mut result = validate_str(&content, format);
            result.config_path = Some(actual_path);
            result
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: Some(actual_path),
        },
    }
}

/// Validate a TOML string without touching the filesystem.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    validate_str(toml_str, ConfigFormat::Toml)
}

/// Validate raw config text in any supported format.
#[must_use]
pub fn validate_str(raw: &str, format: ConfigFormat) -> ValidationResult {
    let mut diagnostics = Vec::new();
    let substituted = substitute_env(raw);

    // 1. Unresolved env placeholders
    for name in unresolved_placeholders(&substituted) {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "env",
            "",
            format!("environment variable ${{{name}}} is not set"),
        ));
    }

    // 2. Syntax
    let value = match parse_config_value(&substituted, format) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(Severity::Error, "syntax", "", e.to_string()));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    // 3. Unknown fields
    check_unknown_fields(&value, &config_shape(), "", &mut diagnostics);

    // 4. Type check, then semantic checks on the typed config
    match serde_json::from_value::<BambooConfig>(value) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn child_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Walk the value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &serde_json::Value,
    schema: &Shape,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (serde_json::Value::Object(map), Shape::Table(known)) => {
            for (key, child) in map {
                let path = child_path(prefix, key);
                if let Some(child_schema) = known.get(key.as_str()) {
                    check_unknown_fields(child, child_schema, &path, diagnostics);
                    continue;
                }
                let level = if prefix.is_empty() {
                    " at top level"
                } else {
                    ""
                };
                let message = match closest_key(key, known.keys().copied()) {
                    Some(s) => format!("unknown field{level} (did you mean \"{s}\"?)"),
                    None => format!("unknown field{level}"),
                };
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "unknown-field",
                    path,
                    message,
                ));
            }
        },
        (serde_json::Value::Array(items), Shape::List(item_schema)) => {
            for (i, item) in items.iter().enumerate() {
                check_unknown_fields(item, item_schema, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        // Leaf or type mismatch; type errors are caught by deserialization.
        _ => {},
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn check_semantics(config: &BambooConfig, diagnostics: &mut Vec<Diagnostic>) {
    check_gateway(config, diagnostics);
    check_security(config, diagnostics);
    check_provider(config, diagnostics);
    check_channels(config, diagnostics);
    check_cron(config, diagnostics);
    check_runtime(config, diagnostics);
}

fn check_gateway(config: &BambooConfig, diagnostics: &mut Vec<Diagnostic>) {
    let gw = &config.gateway;
    if !is_loopback_host(&gw.host) {
        if gw.allow_public_bind {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "security",
                "gateway.host",
                format!("gateway is exposed on non-loopback address {}", gw.host),
            ));
        } else {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "security",
                "gateway.host",
                format!(
                    "binding to {} requires gateway.allow_public_bind = true",
                    gw.host
                ),
            ));
        }
    }
    if gw.pairing_code.is_none() {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "security",
            "gateway.pairing_code",
            "no pairing code configured; POST /pair will refuse every request",
        ));
    }
    if gw.max_body_bytes == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "gateway.max_body_bytes",
            "must be greater than zero",
        ));
    }
    if gw.request_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "gateway.request_timeout_secs",
            "must be greater than zero",
        ));
    }
}

fn check_security(config: &BambooConfig, diagnostics: &mut Vec<Diagnostic>) {
    for (i, entry) in config.security.egress_allowlist.iter().enumerate() {
        let path = format!("security.egress_allowlist[{i}]");
        if entry.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "value",
                path,
                "empty allowlist entry",
            ));
        } else if entry.contains('/') && entry.parse::<ipnet::IpNet>().is_err() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "value",
                path,
                format!("\"{entry}\" is not a valid CIDR range"),
            ));
        } else if entry == "*" {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "security",
                path,
                "wildcard entry allows every outbound destination",
            ));
        }
    }
    if config.security.token_ttl_secs == Some(0) {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "security.token_ttl_secs",
            "a zero TTL would expire every token on issue",
        ));
    }
}

fn check_url(raw: &str, path: String, diagnostics: &mut Vec<Diagnostic>) {
    match url::Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {},
        Ok(url) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            path,
            format!("unsupported URL scheme \"{}\"", url.scheme()),
        )),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            path,
            format!("invalid URL: {e}"),
        )),
    }
}

fn check_provider(config: &BambooConfig, diagnostics: &mut Vec<Diagnostic>) {
    match (&config.provider.kind, &config.provider.endpoint) {
        (ProviderKind::Http, None) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "provider.endpoint",
            "provider kind \"http\" requires an endpoint",
        )),
        (_, Some(endpoint)) => check_url(endpoint, "provider.endpoint".into(), diagnostics),
        (ProviderKind::Echo, None) => {},
    }
}

fn check_channels(config: &BambooConfig, diagnostics: &mut Vec<Diagnostic>) {
    let mut seen = HashSet::new();
    for (i, channel) in config.channels.iter().enumerate() {
        let path = format!("channels[{i}]");
        let name = channel.name.trim();
        if name.is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "channel",
                format!("{path}.name"),
                "channel name must not be empty",
            ));
        } else if EventSource::RESERVED.contains(&name) {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "channel",
                format!("{path}.name"),
                format!("\"{name}\" is reserved"),
            ));
        } else if !seen.insert(name.to_string()) {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "channel",
                format!("{path}.name"),
                format!("duplicate channel name \"{name}\""),
            ));
        }

        match (&channel.kind, &channel.endpoint) {
            (ChannelKind::LongPoll, None) => diagnostics.push(Diagnostic::new(
                Severity::Error,
                "channel",
                format!("{path}.endpoint"),
                "long_poll channels require an endpoint",
            )),
            (_, Some(endpoint)) => check_url(endpoint, format!("{path}.endpoint"), diagnostics),
            (ChannelKind::Webhook, None) => {},
        }
    }
}

fn check_cron(config: &BambooConfig, diagnostics: &mut Vec<Diagnostic>) {
    let mut ids = HashSet::new();
    for (i, job) in config.cron.jobs.iter().enumerate() {
        let path = format!("cron.jobs[{i}]");
        let kinds = [job.cron.is_some(), job.every.is_some(), job.at.is_some()]
            .into_iter()
            .filter(|set| *set)
            .count();
        if kinds != 1 {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "cron",
                path.clone(),
                "exactly one of cron, every, at must be set",
            ));
        }
        if let Some(expr) = &job.cron {
            let fields = expr.split_whitespace().count();
            if !(5..=7).contains(&fields) {
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "cron",
                    format!("{path}.cron"),
                    format!("expected 5 to 7 fields, found {fields}"),
                ));
            }
        }
        if let Some(tz) = &job.tz
            && tz.parse::<chrono_tz::Tz>().is_err()
        {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "cron",
                format!("{path}.tz"),
                format!("unknown timezone \"{tz}\""),
            ));
        }
        if job.command.trim().is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "cron",
                format!("{path}.command"),
                "command must not be empty",
            ));
        }
        if !ids.insert(job.job_id().to_string()) {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "cron",
                path,
                format!("duplicate job id \"{}\"", job.job_id()),
            ));
        }
    }
}

fn check_runtime(config: &BambooConfig, diagnostics: &mut Vec<Diagnostic>) {
    let sup = &config.supervisor;
    if sup.backoff_initial_ms > sup.backoff_max_ms {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "value",
            "supervisor.backoff_initial_ms",
            "initial backoff exceeds backoff_max_ms",
        ));
    }
    let positive = [
        ("supervisor.failure_threshold", u64::from(sup.failure_threshold)),
        ("supervisor.heartbeat_interval_secs", sup.heartbeat_interval_secs),
        ("supervisor.backoff_initial_ms", sup.backoff_initial_ms),
        ("dispatch.queue_capacity", config.dispatch.queue_capacity as u64),
        ("dispatch.agent_timeout_secs", config.dispatch.agent_timeout_secs),
        ("cron.rate_limit_max", config.cron.rate_limit_max as u64),
    ];
    for (path, value) in positive {
        if value == 0 {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "value",
                path,
                "must be greater than zero",
            ));
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn find<'a>(result: &'a ValidationResult, path: &str) -> Option<&'a Diagnostic> {
        result.diagnostics.iter().find(|d| d.path == path)
    }

    #[rstest]
    #[case("hello", "hello", 0)]
    #[case("", "abc", 3)]
    #[case("abc", "", 3)]
    #[case("gateway", "gatway", 1)]
    #[case("cat", "car", 1)]
    #[case("serer", "server", 1)]
    #[case("gatewya", "gateway", 1)]
    #[case("ab", "ba", 1)]
    fn edit_distances(#[case] a: &str, #[case] b: &str, #[case] expected: usize) {
        assert_eq!(edit_distance(a, b), expected);
    }

    #[test]
    fn closest_key_scales_with_length_and_breaks_ties_by_order() {
        let keys = ["host", "port", "reply_mode"];
        assert_eq!(closest_key("prot", keys.iter().copied()), Some("port"));
        assert_eq!(closest_key("reply_mdoe", keys.iter().copied()), Some("reply_mode"));
        assert_eq!(closest_key("xy", keys.iter().copied()), None);
        assert_eq!(closest_key("hort", ["port", "host"].into_iter()), Some("host"));
    }

    #[test]
    fn empty_config_is_valid() {
        let result = validate_toml_str("");
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn unknown_top_level_key_with_suggestion() {
        let result = validate_toml_str("gatway = 42\n");
        let d = find(&result, "gatway").expect("diagnostic for gatway");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.category, "unknown-field");
        assert!(d.message.contains("gateway"), "{}", d.message);
    }

    #[test]
    fn unknown_field_inside_channel_entry() {
        let result = validate_toml_str(
            r#"
[[channels]]
name = "ops"
kind = "webhook"
credentals = "x"
"#,
        );
        let d = find(&result, "channels[0].credentals").expect("diagnostic");
        assert!(d.message.contains("credentials"));
    }

    #[test]
    fn public_bind_without_flag_is_error() {
        let result = validate_toml_str("[gateway]\nhost = \"0.0.0.0\"\n");
        let d = find(&result, "gateway.host").unwrap();
        assert_eq!(d.severity, Severity::Error);

        let result =
            validate_toml_str("[gateway]\nhost = \"0.0.0.0\"\nallow_public_bind = true\n");
        assert_eq!(find(&result, "gateway.host").unwrap().severity, Severity::Warning);
    }

    #[rstest]
    #[case("cron")]
    #[case("gateway")]
    fn reserved_channel_names_are_rejected(#[case] name: &str) {
        let toml = format!("[[channels]]\nname = \"{name}\"\nkind = \"webhook\"\n");
        let result = validate_toml_str(&toml);
        assert!(find(&result, "channels[0].name").is_some());
    }

    #[test]
    fn duplicate_channel_names_are_rejected() {
        let result = validate_toml_str(
            r#"
[[channels]]
name = "ops"
kind = "webhook"

[[channels]]
name = "ops"
kind = "webhook"
"#,
        );
        let d = find(&result, "channels[1].name").unwrap();
        assert!(d.message.contains("duplicate"));
    }

    #[test]
    fn long_poll_requires_endpoint() {
        let result = validate_toml_str("[[channels]]\nname = \"ops\"\nkind = \"long_poll\"\n");
        assert!(find(&result, "channels[0].endpoint").is_some());
    }

    #[test]
    fn cron_job_needs_exactly_one_schedule() {
        let result = validate_toml_str(
            r#"
[[cron.jobs]]
name = "both"
cron = "*/5 * * * *"
every = "5m"
command = "x"
"#,
        );
        assert!(find(&result, "cron.jobs[0]").is_some());
    }

    #[test]
    fn cron_job_with_bad_timezone() {
        let result = validate_toml_str(
            r#"
[[cron.jobs]]
name = "tz"
cron = "0 9 * * *"
tz = "Mars/Olympus"
command = "x"
"#,
        );
        let d = find(&result, "cron.jobs[0].tz").unwrap();
        assert!(d.message.contains("Mars/Olympus"));
    }

    #[test]
    fn bad_cidr_in_egress_allowlist() {
        let result = validate_toml_str("[security]\negress_allowlist = [\"10.0.0.0/99\"]\n");
        assert!(find(&result, "security.egress_allowlist[0]").is_some());
    }

    #[test]
    fn type_error_is_reported() {
        let result = validate_toml_str("[gateway]\nport = \"eighty\"\n");
        assert!(result.diagnostics.iter().any(|d| d.category == "type-error"));
    }

    #[test]
    fn syntax_error_stops_validation() {
        let result = validate_toml_str("[gateway\n");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn yaml_is_validated_too() {
        let result = validate_str("gateway:\n  hots: x\n", ConfigFormat::Yaml);
        assert!(find(&result, "gateway.hots").is_some());
    }

    #[test]
    fn validate_reads_file_and_records_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bambooclaw.toml");
        std::fs::write(&path, "[dispatch]\nqueue_capacity = 0\n").unwrap();
        let result = validate(Some(&path));
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
        assert!(find(&result, "dispatch.queue_capacity").is_some());
    }
}
