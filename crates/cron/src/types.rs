//! Core data types for the scheduler.

use serde::{Deserialize, Serialize};

/// How a job is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    /// One-shot: fire once at `at_ms` (epoch millis).
    At { at_ms: u64 },
    /// Fixed interval anchored at `anchor_ms`: fires at `anchor + k * every`.
    Every { every_ms: u64, anchor_ms: u64 },
    /// Cron expression, 5 fields or 6/7 with seconds and year.
    Cron { expr: String },
}

impl CronSchedule {
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::At { .. })
    }

    /// Short human description used in listings.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::At { at_ms } => format!("at {}", crate::parse::format_ms(*at_ms)),
            Self::Every { every_ms, .. } => {
                format!("every {}", crate::parse::format_duration_ms(*every_ms))
            },
            Self::Cron { expr } => format!("cron {expr}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Active,
    Paused,
    /// A one-shot that has fired.
    Completed,
    /// The schedule can no longer be computed.
    Failed,
}

impl JobState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single job run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    /// The previous run was still in flight.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastResult {
    pub status: RunStatus,
    pub at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: CronSchedule,
    /// IANA timezone used to evaluate cron expressions; UTC when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Text handed to the dispatcher as the event payload.
    pub command: String,
    #[serde(default)]
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<LastResult>,
    /// Declared in the config file; managed by `sync_from_config`.
    #[serde(default)]
    pub from_config: bool,
    #[serde(skip)]
    pub running_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Record of one run, stored in run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CronRunRecord {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Reply text produced by the agent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl CronRunRecord {
    #[must_use]
    pub fn last_result(&self) -> LastResult {
        LastResult {
            status: self.status,
            at_ms: self.finished_at_ms,
            error: self.error.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Input for creating a job.
#[derive(Debug, Clone)]
pub struct CronJobCreate {
    /// Generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub schedule: CronSchedule,
    pub timezone: Option<String>,
    pub command: String,
    pub paused: bool,
    pub from_config: bool,
}

impl CronJobCreate {
    #[must_use]
    pub fn new(name: impl Into<String>, schedule: CronSchedule, command: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            schedule,
            timezone: None,
            command: command.into(),
            paused: false,
            from_config: false,
        }
    }

    #[must_use]
    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }
}

/// Summary status of the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CronStatus {
    pub running: bool,
    pub job_count: usize,
    pub active_count: usize,
    pub paused_count: usize,
    pub next_fire_at_ms: Option<u64>,
    pub last_success_at_ms: Option<u64>,
    /// Backward wall-clock jumps seen by the timer loop.
    pub clock_skew_events: u64,
}

/// What `sync_from_config` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Entries that could not be applied, with the reason.
    pub rejected: Vec<(String, String)>,
}
