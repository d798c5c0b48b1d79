//! The scheduler: timer loop, job firing, and job management.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    bambooclaw_common::{AuthContext, Event, EventSender, EventSource, Outcome, Payload},
    bambooclaw_config::{CronConfig, CronJobEntry},
    chrono::{DateTime, Utc},
    tokio::{
        sync::{Mutex, Notify, RwLock},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    parse::{now_ms, parse_absolute_time_ms, parse_duration_ms},
    schedule::{compute_next_fire, validate_schedule},
    store::CronStore,
    types::{
        CronJob, CronJobCreate, CronRunRecord, CronSchedule, CronStatus, JobState, LastResult,
        RunStatus, SyncReport,
    },
};

/// Backward clock jumps up to this size are treated as jitter.
const SKEW_TOLERANCE_MS: u64 = 1_000;

/// Upper bound on one timer sleep, so wall-clock jumps are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// A run still marked in flight this long after its outcome deadline is
/// considered lost.
const STUCK_GRACE_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_per_window: usize,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window_ms: 60_000,
        }
    }
}

/// Sliding-window limiter on job creation.
struct RateLimiter {
    timestamps: VecDeque<u64>,
    config: RateLimitConfig,
}

impl RateLimiter {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            timestamps: VecDeque::new(),
            config,
        }
    }

    fn check(&mut self, now: u64) -> Result<()> {
        let cutoff = now.saturating_sub(self.config.window_ms);
        while self.timestamps.front().is_some_and(|&ts| ts < cutoff) {
            self.timestamps.pop_front();
        }
        if self.timestamps.len() >= self.config.max_per_window {
            return Err(Error::RateLimited {
                max: self.config.max_per_window,
                window_secs: self.config.window_ms / 1000,
            });
        }
        self.timestamps.push_back(now);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CronSettings {
    /// How long a fired job waits for the dispatcher's outcome.
    pub outcome_timeout: Duration,
    pub rate_limit: RateLimitConfig,
}

impl CronSettings {
    #[must_use]
    pub fn from_config(config: &CronConfig) -> Self {
        Self {
            outcome_timeout: Duration::from_secs(config.outcome_timeout_secs),
            rate_limit: RateLimitConfig {
                max_per_window: config.rate_limit_max,
                window_ms: config.rate_limit_window_secs.saturating_mul(1000),
            },
        }
    }
}

impl Default for CronSettings {
    fn default() -> Self {
        Self::from_config(&CronConfig::default())
    }
}

#[derive(Default)]
struct ClockWatch {
    last_tick_ms: Option<u64>,
    skew_events: u64,
}

pub struct CronService {
    store: Arc<dyn CronStore>,
    events: EventSender,
    settings: CronSettings,
    jobs: RwLock<Vec<CronJob>>,
    wake_notify: Notify,
    cancel: CancellationToken,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    rate_limiter: Mutex<RateLimiter>,
    clock: std::sync::Mutex<ClockWatch>,
    /// Epoch millis of the last successful fire; zero when none.
    last_success_ms: AtomicU64,
}

impl CronService {
    pub fn new(store: Arc<dyn CronStore>, events: EventSender, settings: CronSettings) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            rate_limiter: Mutex::new(RateLimiter::new(settings.rate_limit.clone())),
            settings,
            jobs: RwLock::new(Vec::new()),
            wake_notify: Notify::new(),
            cancel: CancellationToken::new(),
            timer_handle: Mutex::new(None),
            running: AtomicBool::new(false),
            clock: std::sync::Mutex::new(ClockWatch::default()),
            last_success_ms: AtomicU64::new(0),
        })
    }

    /// Load jobs from the store and compute their next fire times. Overdue
    /// one-shots stay due and fire on the first tick.
    pub async fn load(&self) -> Result<()> {
        let mut loaded = self.store.load_jobs().await?;
        loaded.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        let last_success = loaded
            .iter()
            .filter_map(|j| j.last_result.as_ref())
            .filter(|r| r.status == RunStatus::Ok)
            .map(|r| r.at_ms)
            .max()
            .unwrap_or(0);
        self.last_success_ms.fetch_max(last_success, Ordering::SeqCst);
        info!(count = loaded.len(), "loaded cron jobs");
        *self.jobs.write().await = loaded;
        self.recompute_all(now_ms()).await;
        Ok(())
    }

    /// Load jobs and start the timer loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.load().await?;
        self.running.store(true, Ordering::SeqCst);
        let svc = Arc::clone(self);
        let handle = tokio::spawn(async move {
            svc.timer_loop().await;
        });
        *self.timer_handle.lock().await = Some(handle);
        info!("cron scheduler started");
        Ok(())
    }

    /// Stop the timer loop, waiting up to `grace` before aborting it.
    pub async fn stop(&self, grace: Duration) {
        self.cancel.cancel();
        self.wake_notify.notify_one();
        if let Some(mut handle) = self.timer_handle.lock().await.take()
            && tokio::time::timeout(grace, &mut handle).await.is_err()
        {
            warn!("cron timer loop did not stop in time, aborting");
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("cron scheduler stopped");
    }

    /// Add a job from a cron expression, evaluated in `tz` (UTC if unset).
    pub async fn add(
        &self,
        name: &str,
        expr: &str,
        tz: Option<&str>,
        command: &str,
    ) -> Result<CronJob> {
        let mut spec = CronJobCreate::new(
            name,
            CronSchedule::Cron {
                expr: expr.trim().to_string(),
            },
            command,
        );
        spec.timezone = tz.map(str::to_string);
        self.create(spec).await
    }

    /// Add a one-shot job. Timestamps not in the future are rejected.
    pub async fn add_at(&self, name: &str, at: DateTime<Utc>, command: &str) -> Result<CronJob> {
        let at_ms = u64::try_from(at.timestamp_millis())
            .map_err(|_| Error::invalid_schedule("timestamp is before 1970"))?;
        if at_ms <= now_ms() {
            return Err(Error::invalid_schedule(format!(
                "timestamp {} is in the past",
                at.to_rfc3339()
            )));
        }
        self.create(CronJobCreate::new(name, CronSchedule::At { at_ms }, command))
            .await
    }

    /// Add a fixed-interval job anchored at the current time.
    pub async fn add_every(&self, name: &str, interval: Duration, command: &str) -> Result<CronJob> {
        let every_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if every_ms == 0 {
            return Err(Error::invalid_schedule("interval must be greater than zero"));
        }
        let schedule = CronSchedule::Every {
            every_ms,
            anchor_ms: now_ms(),
        };
        self.create(CronJobCreate::new(name, schedule, command)).await
    }

    /// Add a one-shot job that fires after `delay`.
    pub async fn once(&self, name: &str, delay: Duration, command: &str) -> Result<CronJob> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if delay_ms == 0 {
            return Err(Error::invalid_schedule("delay must be greater than zero"));
        }
        let at_ms = now_ms().saturating_add(delay_ms);
        self.create(CronJobCreate::new(name, CronSchedule::At { at_ms }, command))
            .await
    }

    /// Validate, rate-limit, persist, and schedule a new job.
    pub async fn create(&self, spec: CronJobCreate) -> Result<CronJob> {
        if spec.name.trim().is_empty() {
            return Err(Error::invalid_schedule("job name must not be empty"));
        }
        if spec.command.trim().is_empty() {
            return Err(Error::invalid_schedule("job command must not be empty"));
        }
        validate_schedule(&spec.schedule, spec.timezone.as_deref())?;

        let now = now_ms();
        let id = spec
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut jobs = self.jobs.write().await;
        if jobs.iter().any(|j| j.id == id) {
            return Err(Error::invalid_schedule(format!("job {id} already exists")));
        }
        if !spec.from_config {
            self.rate_limiter.lock().await.check(now)?;
        }

        let state = if spec.paused {
            JobState::Paused
        } else {
            JobState::Active
        };
        let next_fire_at_ms = match state {
            JobState::Active => {
                let next = compute_next_fire(&spec.schedule, spec.timezone.as_deref(), now)?;
                if next.is_none() {
                    return Err(Error::invalid_schedule("schedule has no future occurrence"));
                }
                next
            },
            _ => None,
        };
        let job = CronJob {
            id,
            name: spec.name.trim().to_string(),
            schedule: spec.schedule,
            timezone: spec.timezone,
            command: spec.command,
            state,
            next_fire_at_ms,
            last_result: None,
            from_config: spec.from_config,
            running_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.store.save_job(&job).await?;
        jobs.push(job.clone());
        drop(jobs);

        self.wake_notify.notify_one();
        info!(
            id = %job.id,
            name = %job.name,
            schedule = %job.schedule.describe(),
            "cron job added"
        );
        Ok(job)
    }

    /// Active → Paused. Pausing a paused job is a no-op.
    pub async fn pause(&self, id: &str) -> Result<CronJob> {
        let job = self
            .mutate(id, |job, _now| match job.state {
                JobState::Active | JobState::Paused => {
                    job.state = JobState::Paused;
                    job.next_fire_at_ms = None;
                    Ok(())
                },
                state => Err(Error::invalid_schedule(format!(
                    "job {} is {state} and cannot be paused",
                    job.id
                ))),
            })
            .await?;
        info!(id, "cron job paused");
        Ok(job)
    }

    /// Paused or Failed → Active with a fresh next fire time.
    pub async fn resume(&self, id: &str) -> Result<CronJob> {
        let job = self
            .mutate(id, |job, now| {
                if job.state == JobState::Completed {
                    return Err(Error::invalid_schedule(format!(
                        "job {} has completed",
                        job.id
                    )));
                }
                let next = compute_next_fire(&job.schedule, job.timezone.as_deref(), now)?
                    .ok_or_else(|| Error::invalid_schedule("schedule has no future occurrence"))?;
                job.state = JobState::Active;
                job.next_fire_at_ms = Some(next);
                Ok(())
            })
            .await?;
        self.wake_notify.notify_one();
        info!(id, "cron job resumed");
        Ok(job)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if !jobs.iter().any(|j| j.id == id) {
            return Err(Error::job_not_found(id));
        }
        match self.store.delete_job(id).await {
            Ok(()) | Err(Error::JobNotFound { .. }) => {},
            Err(e) => return Err(e),
        }
        jobs.retain(|j| j.id != id);
        drop(jobs);
        self.wake_notify.notify_one();
        info!(id, "cron job removed");
        Ok(())
    }

    pub async fn list(&self) -> Vec<CronJob> {
        self.jobs.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Result<CronJob> {
        self.jobs
            .read()
            .await
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| Error::job_not_found(id))
    }

    /// Fire a job now regardless of its state and wait for the outcome. The
    /// recurring schedule is left untouched; an active one-shot completes.
    pub async fn run(self: &Arc<Self>, id: &str) -> Result<CronRunRecord> {
        let now = now_ms();
        let job = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| Error::job_not_found(id))?;
            if job.running_at_ms.is_some() {
                return Err(Error::invalid_schedule(format!("job {id} is already running")));
            }
            job.running_at_ms = Some(now);
            if job.schedule.is_one_shot() && job.state == JobState::Active {
                job.state = JobState::Completed;
                job.next_fire_at_ms = None;
            }
            job.clone()
        };
        self.persist(&job).await;
        self.wake_notify.notify_one();
        Ok(self.execute(job, now).await)
    }

    pub async fn runs(&self, job_id: &str, limit: usize) -> Result<Vec<CronRunRecord>> {
        self.store.get_runs(job_id, limit).await
    }

    pub async fn status(&self) -> CronStatus {
        let jobs = self.jobs.read().await;
        let count = |state| jobs.iter().filter(|j| j.state == state).count();
        let last_success = self.last_success_ms.load(Ordering::SeqCst);
        CronStatus {
            running: self.running.load(Ordering::SeqCst),
            job_count: jobs.len(),
            active_count: count(JobState::Active),
            paused_count: count(JobState::Paused),
            next_fire_at_ms: jobs
                .iter()
                .filter(|j| j.state == JobState::Active)
                .filter_map(|j| j.next_fire_at_ms)
                .min(),
            last_success_at_ms: (last_success > 0).then_some(last_success),
            clock_skew_events: self
                .clock
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .skew_events,
        }
    }

    /// Reconcile config-declared jobs: add new entries, update changed ones,
    /// and drop config jobs no longer declared. Jobs created at runtime are
    /// left alone.
    pub async fn sync_from_config(&self, config: &CronConfig) -> SyncReport {
        let now = now_ms();
        let mut report = SyncReport::default();
        let mut declared = HashSet::new();
        let mut changed = Vec::new();

        let mut jobs = self.jobs.write().await;
        for entry in &config.jobs {
            let id = entry.job_id().to_string();
            if !declared.insert(id.clone()) {
                report.rejected.push((id, "duplicate job id".into()));
                continue;
            }
            match apply_entry(&mut jobs, entry, &id, now) {
                Ok(Applied::Added(job)) => {
                    report.added.push(id);
                    changed.push(job);
                },
                Ok(Applied::Updated(job)) => {
                    report.updated.push(id);
                    changed.push(job);
                },
                Ok(Applied::Unchanged) => {},
                Err(e) => {
                    warn!(id = %id, error = %e, "cron config entry rejected");
                    report.rejected.push((id, e.to_string()));
                },
            }
        }

        let stale: Vec<String> = jobs
            .iter()
            .filter(|j| j.from_config && !declared.contains(&j.id))
            .map(|j| j.id.clone())
            .collect();
        jobs.retain(|j| !(j.from_config && !declared.contains(&j.id)));
        drop(jobs);

        for job in &changed {
            self.persist(job).await;
        }
        for id in stale {
            if let Err(e) = self.store.delete_job(&id).await {
                warn!(id = %id, error = %e, "failed to delete stale config job");
            }
            report.removed.push(id);
        }
        if !(report.added.is_empty() && report.updated.is_empty() && report.removed.is_empty()) {
            self.wake_notify.notify_one();
            info!(
                added = report.added.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "cron jobs synced from config"
            );
        }
        report
    }

    // ── Internal ────────────────────────────────────────────────────────

    async fn timer_loop(self: &Arc<Self>) {
        loop {
            let now = now_ms();
            if self.observe_clock(now) {
                self.recompute_all(now).await;
            }
            self.process_due_jobs(now).await;

            let wait = self.next_wake(now_ms()).await;
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.wake_notify.notified() => {
                    debug!("timer loop woken by notify");
                },
                () = sleep_or_forever(wait) => {},
            }
        }
        debug!("cron timer loop exited");
    }

    /// Time until the earliest active fire, capped at `MAX_SLEEP`. `None`
    /// when nothing is scheduled. Jobs still in flight count too: their
    /// grid points must be consumed on time as skips.
    async fn next_wake(&self, now: u64) -> Option<Duration> {
        self.jobs
            .read()
            .await
            .iter()
            .filter(|j| j.state == JobState::Active)
            .filter_map(|j| j.next_fire_at_ms)
            .min()
            .map(|t| Duration::from_millis(t.saturating_sub(now)).min(MAX_SLEEP))
    }

    /// Record a tick. Returns true when the wall clock moved backwards by
    /// more than the tolerance since the previous tick.
    fn observe_clock(&self, now: u64) -> bool {
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        let skewed = match clock.last_tick_ms {
            Some(last) if last > now.saturating_add(SKEW_TOLERANCE_MS) => {
                clock.skew_events += 1;
                let err = Error::ClockSkewDetected {
                    skew_ms: last - now,
                };
                warn!(error = %err, events = clock.skew_events, "recomputing cron schedules");
                true
            },
            _ => false,
        };
        clock.last_tick_ms = Some(now);
        skewed
    }

    async fn recompute_all(&self, now: u64) {
        let mut changed = Vec::new();
        {
            let mut jobs = self.jobs.write().await;
            for job in jobs
                .iter_mut()
                .filter(|j| j.state == JobState::Active && j.running_at_ms.is_none())
            {
                let before = (job.state, job.next_fire_at_ms);
                match compute_next_fire(&job.schedule, job.timezone.as_deref(), now) {
                    Ok(Some(next)) => job.next_fire_at_ms = Some(next),
                    Ok(None) => {
                        job.state = JobState::Completed;
                        job.next_fire_at_ms = None;
                    },
                    Err(e) => mark_failed(job, &e, now),
                }
                if before != (job.state, job.next_fire_at_ms) {
                    changed.push(job.clone());
                }
            }
        }
        for job in &changed {
            self.persist(job).await;
        }
    }

    /// Fire every active job due at `now`. Each fire runs on its own task;
    /// the handles are returned so callers can await completion.
    pub(crate) async fn process_due_jobs(
        self: &Arc<Self>,
        now: u64,
    ) -> Vec<JoinHandle<CronRunRecord>> {
        let mut due = Vec::new();
        let mut skipped = Vec::new();
        let mut changed = Vec::new();
        {
            let mut jobs = self.jobs.write().await;
            for job in jobs.iter_mut() {
                if job.state != JobState::Active
                    || !job.next_fire_at_ms.is_some_and(|t| t <= now)
                {
                    continue;
                }
                if job.running_at_ms.is_some() {
                    skipped.push(job.id.clone());
                } else {
                    job.running_at_ms = Some(now);
                    due.push(job.clone());
                }
                advance(job, now);
                changed.push(job.clone());
            }
        }

        for job in &changed {
            self.persist(job).await;
        }
        for id in skipped {
            self.record_skipped(id, now).await;
        }
        self.clear_stuck_jobs(now).await;

        due.into_iter()
            .map(|job| {
                let svc = Arc::clone(self);
                tokio::spawn(async move { svc.execute(job, now).await })
            })
            .collect()
    }

    /// Emit the job's event, wait for the dispatcher's outcome, and record it.
    async fn execute(&self, job: CronJob, started: u64) -> CronRunRecord {
        let event = Event::new(
            EventSource::Cron,
            format!("cron:{}", job.id),
            Payload::text(job.command.clone()),
            AuthContext::Anonymous,
        );
        let event_id = event.id().to_string();
        info!(id = %job.id, name = %job.name, event_id = %event_id, "firing cron job");

        let (status, error, output) = match self.events.send_tracked(event).await {
            Err(e) => (RunStatus::Error, Some(e.to_string()), None),
            Ok(outcome) => match tokio::time::timeout(self.settings.outcome_timeout, outcome).await
            {
                Ok(Ok(Outcome::Completed { replies, .. })) => {
                    let text = replies
                        .iter()
                        .map(|r| r.content.text.as_str())
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n");
                    (RunStatus::Ok, None, (!text.is_empty()).then_some(text))
                },
                Ok(Ok(Outcome::Failed { error })) => (RunStatus::Error, Some(error), None),
                Ok(Err(_)) => (
                    RunStatus::Error,
                    Some("dispatcher dropped the event".into()),
                    None,
                ),
                Err(_) => (
                    RunStatus::Error,
                    Some(format!(
                        "no outcome within {}s",
                        self.settings.outcome_timeout.as_secs()
                    )),
                    None,
                ),
            },
        };

        let finished = now_ms().max(started);
        let run = CronRunRecord {
            job_id: job.id.clone(),
            event_id: Some(event_id),
            started_at_ms: started,
            finished_at_ms: finished,
            status,
            error,
            duration_ms: finished - started,
            output,
        };
        if let Err(e) = self.store.append_run(&run).await {
            warn!(id = %job.id, error = %e, "failed to record cron run");
        }
        if status == RunStatus::Ok {
            self.last_success_ms.fetch_max(finished, Ordering::SeqCst);
        }

        let mut missed = false;
        let updated = {
            let mut jobs = self.jobs.write().await;
            jobs.iter_mut().find(|j| j.id == job.id).map(|j| {
                // A grid point that passed before the timer saw it belongs to
                // this run.
                if j.state == JobState::Active
                    && !j.schedule.is_one_shot()
                    && j.next_fire_at_ms.is_some_and(|t| t <= finished)
                {
                    advance(j, finished);
                    missed = true;
                }
                j.running_at_ms = None;
                j.last_result = Some(run.last_result());
                j.clone()
            })
        };
        if let Some(job) = updated {
            self.persist(&job).await;
        }
        if missed {
            self.record_skipped(job.id.clone(), finished).await;
        }
        self.wake_notify.notify_one();

        match &run.error {
            Some(error) => warn!(id = %job.id, duration_ms = run.duration_ms, error = %error, "cron job failed"),
            None => info!(id = %job.id, duration_ms = run.duration_ms, "cron job finished"),
        }
        run
    }

    async fn record_skipped(&self, job_id: String, at: u64) {
        warn!(id = %job_id, "previous run still in flight, skipping");
        let run = CronRunRecord {
            job_id,
            event_id: None,
            started_at_ms: at,
            finished_at_ms: at,
            status: RunStatus::Skipped,
            error: Some("previous run still in flight".into()),
            duration_ms: 0,
            output: None,
        };
        if let Err(e) = self.store.append_run(&run).await {
            warn!(error = %e, "failed to record skipped run");
        }
    }

    async fn clear_stuck_jobs(&self, now: u64) {
        let limit = u64::try_from(self.settings.outcome_timeout.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_add(STUCK_GRACE_MS);
        let mut jobs = self.jobs.write().await;
        for job in jobs.iter_mut() {
            if let Some(running_at) = job.running_at_ms
                && now.saturating_sub(running_at) > limit
            {
                warn!(id = %job.id, "clearing stuck cron run");
                job.running_at_ms = None;
                job.last_result = Some(LastResult {
                    status: RunStatus::Error,
                    at_ms: now,
                    error: Some("run never reported an outcome".into()),
                    duration_ms: now.saturating_sub(running_at),
                });
            }
        }
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<CronJob>
    where
        F: FnOnce(&mut CronJob, u64) -> Result<()>,
    {
        let now = now_ms();
        let job = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| Error::job_not_found(id))?;
            f(job, now)?;
            job.updated_at_ms = now;
            job.clone()
        };
        self.store.save_job(&job).await?;
        Ok(job)
    }

    async fn persist(&self, job: &CronJob) {
        if let Err(e) = self.store.save_job(job).await {
            warn!(id = %job.id, error = %e, "failed to persist cron job");
        }
    }
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

/// Move a job past the fire at `now`: one-shots complete, recurring jobs
/// move to their next grid point.
fn advance(job: &mut CronJob, now: u64) {
    if job.schedule.is_one_shot() {
        job.state = JobState::Completed;
        job.next_fire_at_ms = None;
        return;
    }
    match compute_next_fire(&job.schedule, job.timezone.as_deref(), now) {
        Ok(Some(next)) => job.next_fire_at_ms = Some(next),
        Ok(None) => {
            job.state = JobState::Completed;
            job.next_fire_at_ms = None;
        },
        Err(e) => mark_failed(job, &e, now),
    }
}

fn mark_failed(job: &mut CronJob, error: &Error, now: u64) {
    warn!(id = %job.id, error = %error, "cron schedule cannot be computed, marking failed");
    job.state = JobState::Failed;
    job.next_fire_at_ms = None;
    job.last_result = Some(LastResult {
        status: RunStatus::Error,
        at_ms: now,
        error: Some(error.to_string()),
        duration_ms: 0,
    });
}

enum Applied {
    Added(CronJob),
    Updated(CronJob),
    Unchanged,
}

fn entry_schedule(entry: &CronJobEntry, now: u64) -> Result<CronSchedule> {
    match (&entry.cron, &entry.every, &entry.at) {
        (Some(expr), None, None) => Ok(CronSchedule::Cron {
            expr: expr.trim().to_string(),
        }),
        (None, Some(every), None) => Ok(CronSchedule::Every {
            every_ms: parse_duration_ms(every)?,
            anchor_ms: now,
        }),
        (None, None, Some(at)) => Ok(CronSchedule::At {
            at_ms: parse_absolute_time_ms(at)?,
        }),
        _ => Err(Error::invalid_schedule(
            "exactly one of cron, every, at must be set",
        )),
    }
}

fn same_schedule(current: &CronSchedule, declared: &CronSchedule) -> bool {
    match (current, declared) {
        (
            CronSchedule::Every { every_ms: a, .. },
            CronSchedule::Every { every_ms: b, .. },
        ) => a == b,
        _ => current == declared,
    }
}

fn apply_entry(jobs: &mut Vec<CronJob>, entry: &CronJobEntry, id: &str, now: u64) -> Result<Applied> {
    if entry.command.trim().is_empty() {
        return Err(Error::invalid_schedule("job command must not be empty"));
    }
    let declared = entry_schedule(entry, now)?;
    validate_schedule(&declared, entry.tz.as_deref())?;

    let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
        let state = if entry.enabled {
            JobState::Active
        } else {
            JobState::Paused
        };
        let next_fire_at_ms = if state == JobState::Active {
            if let CronSchedule::At { at_ms } = declared
                && at_ms <= now
            {
                return Err(Error::invalid_schedule("timestamp is in the past"));
            }
            compute_next_fire(&declared, entry.tz.as_deref(), now)?
        } else {
            None
        };
        let job = CronJob {
            id: id.to_string(),
            name: entry.name.clone(),
            schedule: declared,
            timezone: entry.tz.clone(),
            command: entry.command.clone(),
            state,
            next_fire_at_ms,
            last_result: None,
            from_config: true,
            running_at_ms: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        jobs.push(job.clone());
        return Ok(Applied::Added(job));
    };

    if !job.from_config {
        return Err(Error::invalid_schedule(format!(
            "id {id} is used by a job created at runtime"
        )));
    }

    let mut dirty = false;
    let schedule_changed =
        !same_schedule(&job.schedule, &declared) || job.timezone != entry.tz;
    if schedule_changed {
        job.schedule = declared;
        job.timezone = entry.tz.clone();
        if matches!(job.state, JobState::Completed | JobState::Failed) {
            job.state = JobState::Active;
        }
        dirty = true;
    }
    if job.name != entry.name || job.command != entry.command {
        job.name = entry.name.clone();
        job.command = entry.command.clone();
        dirty = true;
    }
    match (entry.enabled, job.state) {
        (false, JobState::Active) => {
            job.state = JobState::Paused;
            job.next_fire_at_ms = None;
            dirty = true;
        },
        (true, JobState::Paused) => {
            job.state = JobState::Active;
            dirty = true;
        },
        _ => {},
    }
    if !dirty {
        return Ok(Applied::Unchanged);
    }
    if job.state == JobState::Active && job.running_at_ms.is_none() {
        job.next_fire_at_ms = compute_next_fire(&job.schedule, job.timezone.as_deref(), now)?;
    }
    job.updated_at_ms = now;
    Ok(Applied::Updated(job.clone()))
}
