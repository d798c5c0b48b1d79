//! Job scheduler. Fired jobs become `cron` events on the shared bus; the
//! dispatcher's outcome is recorded as the job's last result.
//!
//! Jobs persist through a [`store::CronStore`], by default
//! `<data_dir>/cron/jobs.json` with JSONL run history beside it.

pub mod error;
pub mod parse;
pub mod schedule;
pub mod service;
pub mod store;
pub mod store_file;
pub mod store_memory;
pub mod types;

pub use {
    error::{Error, Result, SchedulingError},
    service::{CronService, CronSettings, RateLimitConfig},
    store::CronStore,
    store_file::FileStore,
    store_memory::InMemoryStore,
    types::{
        CronJob, CronJobCreate, CronRunRecord, CronSchedule, CronStatus, JobState, LastResult,
        RunStatus, SyncReport,
    },
};
