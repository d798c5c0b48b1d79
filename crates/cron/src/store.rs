//! Persistence trait for jobs and run history.

use async_trait::async_trait;

use crate::{
    Result,
    types::{CronJob, CronRunRecord},
};

#[async_trait]
pub trait CronStore: Send + Sync {
    async fn load_jobs(&self) -> Result<Vec<CronJob>>;
    /// Insert or replace by id.
    async fn save_job(&self, job: &CronJob) -> Result<()>;
    /// Fails with `JobNotFound` for an unknown id.
    async fn delete_job(&self, id: &str) -> Result<()>;
    async fn append_run(&self, run: &CronRunRecord) -> Result<()>;
    /// The most recent `limit` runs, oldest first.
    async fn get_runs(&self, job_id: &str, limit: usize) -> Result<Vec<CronRunRecord>>;
}

#[cfg(test)]
pub(crate) fn sample_job(id: &str) -> CronJob {
    use crate::types::{CronSchedule, JobState};
    CronJob {
        id: id.into(),
        name: format!("job-{id}"),
        schedule: CronSchedule::Every {
            every_ms: 60_000,
            anchor_ms: 1_000,
        },
        timezone: None,
        command: "ping".into(),
        state: JobState::Active,
        next_fire_at_ms: Some(61_000),
        last_result: None,
        from_config: false,
        running_at_ms: None,
        created_at_ms: 1_000,
        updated_at_ms: 1_000,
    }
}

#[cfg(test)]
pub(crate) fn sample_run(job_id: &str, started_at_ms: u64) -> CronRunRecord {
    use crate::types::RunStatus;
    CronRunRecord {
        job_id: job_id.into(),
        event_id: None,
        started_at_ms,
        finished_at_ms: started_at_ms + 500,
        status: RunStatus::Ok,
        error: None,
        duration_ms: 500,
        output: None,
    }
}
