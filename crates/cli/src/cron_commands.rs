//! `bambooclaw cron`: inspect and edit the persisted job store.
//!
//! `list` and `runs` only read the store. Edits are refused while a live
//! daemon owns the store; they take effect on the next daemon start.

use std::{path::Path, sync::Arc};

use {
    anyhow::{Context, Result, bail},
    bambooclaw_common::event_bus,
    bambooclaw_config::{BambooConfig, CronConfig},
    bambooclaw_cron::{
        CronJob, CronRunRecord, CronService, CronSettings, CronStore, FileStore, RunStatus,
        parse::{format_ms, parse_duration},
    },
    bambooclaw_daemon::{Supervisor, read_state},
    chrono::{DateTime, Utc},
    clap::Subcommand,
};

use crate::status_commands::Liveness;

#[derive(Subcommand)]
pub enum CronAction {
    /// List all jobs.
    List {
        /// Print jobs as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Add a job from a cron expression.
    Add {
        name: String,
        /// Cron expression, e.g. "0 9 * * 1-5".
        expr: String,
        /// Text handed to the agent when the job fires.
        command: String,
        /// IANA timezone for the expression (UTC when unset).
        #[arg(long)]
        tz: Option<String>,
    },
    /// Add a one-shot job at an RFC 3339 timestamp.
    AddAt {
        name: String,
        at: String,
        command: String,
    },
    /// Add a fixed-interval job, e.g. "30m" or "1h30m".
    AddEvery {
        name: String,
        every: String,
        command: String,
    },
    /// Add a one-shot job that fires after a delay, e.g. "20m".
    Once {
        name: String,
        delay: String,
        command: String,
    },
    /// Pause a job.
    Pause { id: String },
    /// Resume a paused job.
    Resume { id: String },
    /// Delete a job. Its run history is kept.
    Remove { id: String },
    /// Show recent runs of a job, newest first.
    Runs {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

impl CronAction {
    fn mutates(&self) -> bool {
        !matches!(self, Self::List { .. } | Self::Runs { .. })
    }
}

pub async fn handle_cron(action: CronAction) -> Result<()> {
    let config = crate::config_commands::load_validated()?;
    let data_dir = bambooclaw_config::ensure_data_dir()?;
    if action.mutates() {
        ensure_daemon_stopped(&config, &data_dir)?;
    }
    run(&data_dir, &config.cron, action).await
}

/// The daemon keeps its own copy of every job and writes it back on each
/// fire, so edits made under it would be lost.
fn ensure_daemon_stopped(config: &BambooConfig, data_dir: &Path) -> Result<()> {
    let path = Supervisor::state_file(config, data_dir);
    if let Some(state) = read_state(&path)?
        && Liveness::of(&state, Utc::now()) == Liveness::Running
    {
        bail!(
            "the daemon is running (pid {}); stop it before editing cron jobs",
            state.pid
        );
    }
    Ok(())
}

fn store_in(data_dir: &Path) -> Arc<FileStore> {
    Arc::new(FileStore::in_dir(&data_dir.join("cron")))
}

async fn open(data_dir: &Path, config: &CronConfig) -> Result<Arc<CronService>> {
    // The timer loop never starts here, so nothing reads the bus.
    let (events, _rx) = event_bus(1);
    let service = CronService::new(store_in(data_dir), events, CronSettings::from_config(config));
    service.load().await.context("failed to load cron jobs")?;
    Ok(service)
}

/// Jobs as stored, without recomputing fire times.
async fn stored_jobs(store: &FileStore) -> Result<Vec<CronJob>> {
    let mut jobs = store.load_jobs().await.context("failed to read cron jobs")?;
    jobs.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(jobs)
}

async fn run(data_dir: &Path, config: &CronConfig, action: CronAction) -> Result<()> {
    if !action.mutates() {
        return show(&store_in(data_dir), action).await;
    }
    let service = open(data_dir, config).await?;
    edit(&service, action).await
}

async fn show(store: &FileStore, action: CronAction) -> Result<()> {
    match action {
        CronAction::List { json } => {
            let jobs = stored_jobs(store).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No cron jobs.");
            } else {
                for job in &jobs {
                    println!("{}", job_line(job));
                }
            }
        },
        CronAction::Runs { id, limit } => {
            if !stored_jobs(store).await?.iter().any(|j| j.id == id) {
                bail!("cron job not found: {id}");
            }
            let mut runs = store.get_runs(&id, limit).await?;
            if runs.is_empty() {
                println!("No runs recorded for {id}.");
            }
            runs.reverse();
            for record in &runs {
                println!("{}", run_line(record));
            }
        },
        _ => bail!("not a read-only cron command"),
    }
    Ok(())
}

async fn edit(service: &CronService, action: CronAction) -> Result<()> {
    match action {
        CronAction::List { .. } | CronAction::Runs { .. } => {
            bail!("not a cron edit")
        },
        CronAction::Add {
            name,
            expr,
            command,
            tz,
        } => {
            let job = service.add(&name, &expr, tz.as_deref(), &command).await?;
            println!("added {}", job_line(&job));
        },
        CronAction::AddAt { name, at, command } => {
            let at = DateTime::parse_from_rfc3339(at.trim())
                .with_context(|| format!("invalid timestamp '{at}'"))?
                .with_timezone(&Utc);
            let job = service.add_at(&name, at, &command).await?;
            println!("added {}", job_line(&job));
        },
        CronAction::AddEvery {
            name,
            every,
            command,
        } => {
            let job = service
                .add_every(&name, parse_duration(&every)?, &command)
                .await?;
            println!("added {}", job_line(&job));
        },
        CronAction::Once {
            name,
            delay,
            command,
        } => {
            let job = service.once(&name, parse_duration(&delay)?, &command).await?;
            println!("added {}", job_line(&job));
        },
        CronAction::Pause { id } => {
            let job = service.pause(&id).await?;
            println!("paused {}", job_line(&job));
        },
        CronAction::Resume { id } => {
            let job = service.resume(&id).await?;
            println!("resumed {}", job_line(&job));
        },
        CronAction::Remove { id } => {
            service.remove(&id).await?;
            println!("removed {id}");
        },
    }
    Ok(())
}

fn job_line(job: &CronJob) -> String {
    let next = job
        .next_fire_at_ms
        .map(format_ms)
        .unwrap_or_else(|| "-".into());
    let mut line = format!(
        "{}  {:<20} {:<9} {:<24} next {next}",
        job.id,
        job.name,
        job.state.as_str(),
        job.schedule.describe()
    );
    if job.from_config {
        line.push_str("  (config)");
    }
    line
}

fn run_line(record: &CronRunRecord) -> String {
    let status = match record.status {
        RunStatus::Ok => "ok",
        RunStatus::Error => "error",
        RunStatus::Skipped => "skipped",
    };
    let mut line = format!(
        "{}  {status:<7} {}ms",
        format_ms(record.started_at_ms),
        record.duration_ms
    );
    if let Some(err) = &record.error {
        line.push_str(&format!("  {err}"));
    } else if let Some(output) = &record.output {
        line.push_str(&format!("  {output}"));
    }
    line
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        bambooclaw_cron::{CronSchedule, JobState},
        bambooclaw_daemon::{DaemonState, write_state},
        tempfile::TempDir,
    };

    #[tokio::test]
    async fn edits_persist_across_opens() {
        let tmp = TempDir::new().unwrap();
        let config = CronConfig::default();

        let service = open(tmp.path(), &config).await.unwrap();
        edit(
            &service,
            CronAction::AddEvery {
                name: "digest".into(),
                every: "30m".into(),
                command: "summarize inbox".into(),
            },
        )
        .await
        .unwrap();
        let id = service.list().await[0].id.clone();
        edit(&service, CronAction::Pause { id: id.clone() })
            .await
            .unwrap();

        let jobs = stored_jobs(&store_in(tmp.path())).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "digest");
        assert_eq!(jobs[0].state, JobState::Paused);

        run(tmp.path(), &config, CronAction::Remove { id })
            .await
            .unwrap();
        assert!(stored_jobs(&store_in(tmp.path())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_only_commands_leave_the_store_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(tmp.path());
        // An overdue fire time that loading the service would recompute.
        store
            .save_job(&CronJob {
                id: "nightly".into(),
                name: "nightly".into(),
                schedule: CronSchedule::Every {
                    every_ms: 60_000,
                    anchor_ms: 1_000,
                },
                timezone: None,
                command: "backup".into(),
                state: JobState::Active,
                next_fire_at_ms: Some(61_000),
                last_result: None,
                from_config: false,
                running_at_ms: None,
                created_at_ms: 1_000,
                updated_at_ms: 1_000,
            })
            .await
            .unwrap();
        let before = std::fs::read(store.jobs_path()).unwrap();

        let config = CronConfig::default();
        run(tmp.path(), &config, CronAction::List { json: true })
            .await
            .unwrap();
        run(tmp.path(), &config, CronAction::Runs {
            id: "nightly".into(),
            limit: 5,
        })
        .await
        .unwrap();
        assert_eq!(std::fs::read(store.jobs_path()).unwrap(), before);
    }

    #[test]
    fn edits_are_refused_while_the_daemon_is_live() {
        let tmp = TempDir::new().unwrap();
        let config = BambooConfig::default();
        let path = Supervisor::state_file(&config, tmp.path());
        assert!(ensure_daemon_stopped(&config, tmp.path()).is_ok());

        let now = Utc::now();
        let mut state = DaemonState {
            pid: 4242,
            version: "0.1.0".into(),
            running: true,
            started_at: now,
            uptime_secs: 0,
            active_channels: 0,
            channels: Vec::new(),
            last_cron_success_at: None,
            gateway_addr: None,
            heartbeat_interval_secs: 30,
            written_at: now,
        };
        write_state(&path, &state).unwrap();
        let err = ensure_daemon_stopped(&config, tmp.path()).unwrap_err();
        assert!(err.to_string().contains("4242"));

        state.running = false;
        write_state(&path, &state).unwrap();
        assert!(ensure_daemon_stopped(&config, tmp.path()).is_ok());

        assert!(CronAction::Pause { id: "x".into() }.mutates());
        assert!(!CronAction::List { json: false }.mutates());
    }

    #[tokio::test]
    async fn invalid_input_is_reported() {
        let tmp = TempDir::new().unwrap();
        let config = CronConfig::default();

        let bad_expr = CronAction::Add {
            name: "broken".into(),
            expr: "not a cron".into(),
            command: "x".into(),
            tz: None,
        };
        assert!(run(tmp.path(), &config, bad_expr).await.is_err());

        let past = CronAction::AddAt {
            name: "late".into(),
            at: "2001-01-01T00:00:00Z".into(),
            command: "x".into(),
        };
        assert!(run(tmp.path(), &config, past).await.is_err());

        let unknown = CronAction::Runs {
            id: "missing".into(),
            limit: 5,
        };
        assert!(run(tmp.path(), &config, unknown).await.is_err());
        assert!(stored_jobs(&store_in(tmp.path())).await.unwrap().is_empty());
    }

    #[test]
    fn run_line_prefers_error_over_output() {
        let record = CronRunRecord {
            job_id: "j".into(),
            event_id: None,
            started_at_ms: 0,
            finished_at_ms: 12,
            status: RunStatus::Error,
            error: Some("agent timed out".into()),
            duration_ms: 12,
            output: Some("partial".into()),
        };
        let line = run_line(&record);
        assert!(line.contains("error"));
        assert!(line.contains("agent timed out"));
        assert!(!line.contains("partial"));
    }
}
