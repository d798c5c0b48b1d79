use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidExpression { expr: String, message: String },

    #[error("unknown timezone: {timezone}")]
    UnknownTimezone { timezone: String },

    #[error("invalid schedule: {message}")]
    InvalidSchedule { message: String },

    #[error("wall clock moved backwards by {skew_ms}ms")]
    ClockSkewDetected { skew_ms: u64 },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("rate limit exceeded: max {max} jobs per {window_secs} seconds")]
    RateLimited { max: usize, window_secs: u64 },

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SchedulingError {
    #[must_use]
    pub fn invalid_expression(expr: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidExpression {
            expr: expr.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_schedule(message: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    #[must_use]
    pub fn unknown_timezone(timezone: impl Into<String>) -> Self {
        Self::UnknownTimezone {
            timezone: timezone.into(),
        }
    }

    #[must_use]
    pub fn store(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type Error = SchedulingError;
pub type Result<T> = std::result::Result<T, Error>;
