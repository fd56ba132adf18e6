use async_trait::async_trait;
use uuid::Uuid;

use crate::jobs::model::{Job, JobFilter, JobPatch, JobStatus, NewJob};

/// Durable job records. The scheduler and the HTTP layer both hold an
/// `Arc<dyn JobStore>`; nothing else in the crate persists data.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `pending` with `progress = 0`.
    async fn create(&self, job: NewJob) -> anyhow::Result<Job>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>>;

    /// Most recent first. Filters are conjunctive; with no limit every
    /// match is returned.
    async fn list(&self, filter: &JobFilter) -> anyhow::Result<Vec<Job>>;

    /// Merge `patch` into the job and refresh `updated_at`.
    /// Does not check the status graph; callers own that.
    async fn update(&self, id: Uuid, patch: JobPatch) -> anyhow::Result<Option<Job>>;

    /// Like `update`, but only applied while the job's status is one of
    /// `expected`; the check and the write are a single step. `None` means
    /// the job is missing or was in some other status.
    async fn update_if(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        patch: JobPatch,
    ) -> anyhow::Result<Option<Job>>;

    /// Oldest pending job by creation order.
    async fn next_pending(&self) -> anyhow::Result<Option<Job>>;

    async fn count_by_status(&self) -> anyhow::Result<Vec<(JobStatus, i64)>>;
}
