//! JSON file store: all jobs in one file replaced atomically, run history as
//! one JSONL file per job.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    tokio::{fs, io::AsyncWriteExt, sync::Mutex},
    tracing::warn,
};

use crate::{
    Error, Result,
    store::CronStore,
    types::{CronJob, CronRunRecord},
};

pub struct FileStore {
    jobs_path: PathBuf,
    runs_dir: PathBuf,
    /// Serializes read-modify-write cycles on the jobs file.
    write_lock: Mutex<()>,
}

impl FileStore {
    #[must_use]
    pub fn new(jobs_path: PathBuf, runs_dir: PathBuf) -> Self {
        Self {
            jobs_path,
            runs_dir,
            write_lock: Mutex::new(()),
        }
    }

    /// `<dir>/jobs.json` and `<dir>/runs/`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("jobs.json"), dir.join("runs"))
    }

    #[must_use]
    pub fn jobs_path(&self) -> &Path {
        &self.jobs_path
    }

    async fn read_jobs(&self) -> Result<Vec<CronJob>> {
        let data = match fs::read_to_string(&self.jobs_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::store(
                    format!("reading {}", self.jobs_path.display()),
                    e,
                ));
            },
        };
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&data)
            .map_err(|e| Error::store(format!("parsing {}", self.jobs_path.display()), e))
    }

    /// Write to a sibling temp file, then rename over the target.
    async fn write_jobs(&self, jobs: &[CronJob]) -> Result<()> {
        if let Some(parent) = self.jobs_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::store(format!("creating {}", parent.display()), e))?;
        }
        let json = serde_json::to_vec_pretty(jobs)
            .map_err(|e| Error::store("serializing jobs", e))?;
        let tmp = self.jobs_path.with_extension("json.tmp");
        fs::write(&tmp, &json)
            .await
            .map_err(|e| Error::store(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.jobs_path)
            .await
            .map_err(|e| Error::store(format!("replacing {}", self.jobs_path.display()), e))
    }

    fn runs_path(&self, job_id: &str) -> PathBuf {
        let safe: String = job_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.runs_dir.join(format!("{safe}.jsonl"))
    }
}

#[async_trait]
impl CronStore for FileStore {
    async fn load_jobs(&self) -> Result<Vec<CronJob>> {
        self.read_jobs().await
    }

    async fn save_job(&self, job: &CronJob) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.read_jobs().await?;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        self.write_jobs(&jobs).await
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.read_jobs().await?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Err(Error::job_not_found(id));
        }
        self.write_jobs(&jobs).await
    }

    async fn append_run(&self, run: &CronRunRecord) -> Result<()> {
        fs::create_dir_all(&self.runs_dir)
            .await
            .map_err(|e| Error::store(format!("creating {}", self.runs_dir.display()), e))?;
        let path = self.runs_path(&run.job_id);
        let mut line =
            serde_json::to_string(run).map_err(|e| Error::store("serializing run", e))?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::store(format!("opening {}", path.display()), e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::store(format!("appending to {}", path.display()), e))
    }

    async fn get_runs(&self, job_id: &str, limit: usize) -> Result<Vec<CronRunRecord>> {
        let path = self.runs_path(job_id);
        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::store(format!("reading {}", path.display()), e)),
        };
        let mut runs: Vec<CronRunRecord> = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping corrupt run record");
                },
            }
        }
        let start = runs.len().saturating_sub(limit);
        Ok(runs.split_off(start))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store::{sample_job, sample_run},
        tempfile::TempDir,
    };

    #[tokio::test]
    async fn jobs_survive_a_new_store_instance() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::in_dir(tmp.path());
        store.save_job(&sample_job("1")).await.unwrap();
        store.save_job(&sample_job("2")).await.unwrap();

        let reopened = FileStore::in_dir(tmp.path());
        let jobs = reopened.load_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "1");
        assert!(!tmp.path().join("jobs.json.tmp").exists());
    }

    #[tokio::test]
    async fn save_replaces_and_delete_removes() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::in_dir(tmp.path());
        store.save_job(&sample_job("1")).await.unwrap();
        let mut job = sample_job("1");
        job.name = "renamed".into();
        store.save_job(&job).await.unwrap();
        assert_eq!(store.load_jobs().await.unwrap()[0].name, "renamed");

        store.delete_job("1").await.unwrap();
        assert!(store.load_jobs().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_job("1").await,
            Err(Error::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::in_dir(&tmp.path().join("nested"));
        assert!(store.load_jobs().await.unwrap().is_empty());
        assert!(store.get_runs("x", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_jobs_file_is_a_store_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("jobs.json"), "{not json").unwrap();
        let store = FileStore::in_dir(tmp.path());
        assert!(matches!(
            store.load_jobs().await,
            Err(Error::Store { .. })
        ));
    }

    #[tokio::test]
    async fn runs_append_as_jsonl_and_skip_corrupt_lines() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::in_dir(tmp.path());
        store.append_run(&sample_run("j1", 1_000)).await.unwrap();
        store.append_run(&sample_run("j1", 2_000)).await.unwrap();

        let path = tmp.path().join("runs").join("j1.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        raw.push_str("garbage\n");
        std::fs::write(&path, raw).unwrap();
        store.append_run(&sample_run("j1", 3_000)).await.unwrap();

        let runs = store.get_runs("j1", 10).await.unwrap();
        assert_eq!(runs.len(), 3);
        let latest = store.get_runs("j1", 1).await.unwrap();
        assert_eq!(latest[0].started_at_ms, 3_000);
    }

    #[test]
    fn run_file_names_are_sanitized() {
        let store = FileStore::in_dir(Path::new("/data/cron"));
        assert_eq!(
            store.runs_path("../etc/passwd"),
            Path::new("/data/cron/runs/___etc_passwd.jsonl")
        );
    }
}
