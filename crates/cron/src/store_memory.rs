//! Non-persistent store for tests and store-less runs.

use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    Error, Result,
    store::CronStore,
    types::{CronJob, CronRunRecord},
};

#[derive(Default)]
pub struct InMemoryStore {
    jobs: Mutex<BTreeMap<String, CronJob>>,
    runs: Mutex<BTreeMap<String, Vec<CronRunRecord>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CronStore for InMemoryStore {
    async fn load_jobs(&self) -> Result<Vec<CronJob>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.values().cloned().collect())
    }

    async fn save_job(&self, job: &CronJob) -> Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::job_not_found(id))
    }

    async fn append_run(&self, run: &CronRunRecord) -> Result<()> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(run.job_id.clone())
            .or_default()
            .push(run.clone());
        Ok(())
    }

    async fn get_runs(&self, job_id: &str, limit: usize) -> Result<Vec<CronRunRecord>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(records) = runs.get(job_id) else {
            return Ok(Vec::new());
        };
        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store::{sample_job, sample_run},
    };

    #[tokio::test]
    async fn save_replaces_by_id() {
        let store = InMemoryStore::new();
        store.save_job(&sample_job("a")).await.unwrap();
        let mut job = sample_job("a");
        job.name = "renamed".into();
        store.save_job(&job).await.unwrap();

        let jobs = store.load_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "renamed");
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.delete_job("nope").await,
            Err(Error::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn runs_return_most_recent() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.append_run(&sample_run("j1", i * 1_000)).await.unwrap();
        }
        let runs = store.get_runs("j1", 3).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].started_at_ms, 2_000);
        assert!(store.get_runs("other", 3).await.unwrap().is_empty());
    }
}
