use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub progress: f64,
    pub total_items: i64,
    pub completed_items: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// `completed` and `failed` cannot be cancelled. `cancelled` is only a
    /// label and stays open to the scheduler's final write.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => anyhow::bail!("unknown job status: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
        }
    }
}

/// Partial update merged into a stored job. `None` leaves a field untouched;
/// `result`/`error` use a nested option so they can be cleared.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub result: Option<Option<Value>>,
    pub error: Option<Option<String>>,
    pub progress: Option<f64>,
    pub total_items: Option<i64>,
    pub completed_items: Option<i64>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn running() -> Self {
        Self::status(JobStatus::Running)
    }

    pub fn completed(result: Value) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result: Some(Some(result)),
            error: Some(None),
            progress: Some(100.0),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            result: Some(None),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self::status(JobStatus::Cancelled)
    }

    pub fn progress(progress: f64, completed_items: i64) -> Self {
        Self {
            progress: Some(progress),
            completed_items: Some(completed_items),
            ..Self::default()
        }
    }

    pub fn total_items(total_items: i64) -> Self {
        Self {
            total_items: Some(total_items),
            ..Self::default()
        }
    }

    pub fn apply(self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(result) = self.result {
            job.result = result;
        }
        if let Some(error) = self.error {
            job.error = error;
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(total_items) = self.total_items {
            job.total_items = total_items;
        }
        if let Some(completed_items) = self.completed_items {
            job.completed_items = completed_items;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: Option<i64>,
}

impl JobFilter {
    pub const MAX_LIMIT: i64 = 500;

    /// A supplied limit clamped to [1, 500]. `None` means no limit.
    pub fn effective_limit(&self) -> Option<i64> {
        self.limit.map(|l| l.clamp(1, Self::MAX_LIMIT))
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self
                .job_type
                .as_deref()
                .map_or(true, |t| job.job_type == t)
    }
}
