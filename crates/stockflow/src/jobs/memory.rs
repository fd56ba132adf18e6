use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::jobs::model::{Job, JobFilter, JobPatch, JobStatus, NewJob};
use crate::jobs::store::JobStore;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    job: Job,
}

/// Process-local job store. Used when no database is configured and by the
/// test suite. Creation order is tracked with a sequence number so jobs
/// created within the same clock tick still come out FIFO.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, Entry>>>,
    next_seq: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutations (creates and updates) applied so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new_job: NewJob) -> anyhow::Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::now_v7(),
            job_type: new_job.job_type,
            status: JobStatus::Pending,
            payload: new_job.payload,
            result: None,
            error: None,
            progress: 0.0,
            total_items: 0,
            completed_items: 0,
            created_at: now,
            updated_at: now,
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.jobs.write().await.insert(
            job.id,
            Entry {
                seq,
                job: job.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).map(|e| e.job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> anyhow::Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut rows: Vec<&Entry> = jobs.values().filter(|e| filter.matches(&e.job)).collect();
        rows.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        Ok(rows
            .into_iter()
            .take(filter.effective_limit().map_or(usize::MAX, |l| l as usize))
            .map(|e| e.job.clone())
            .collect())
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> anyhow::Result<Option<Job>> {
        self.update_if(id, &JobStatus::ALL, patch).await
    }

    async fn update_if(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        patch: JobPatch,
    ) -> anyhow::Result<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !expected.contains(&entry.job.status) {
            return Ok(None);
        }

        patch.apply(&mut entry.job);
        entry.job.updated_at = Utc::now();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(entry.job.clone()))
    }

    async fn next_pending(&self) -> anyhow::Result<Option<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|e| e.job.status == JobStatus::Pending)
            .min_by(|a, b| a.job.created_at.cmp(&b.job.created_at).then(a.seq.cmp(&b.seq)))
            .map(|e| e.job.clone()))
    }

    async fn count_by_status(&self) -> anyhow::Result<Vec<(JobStatus, i64)>> {
        let jobs = self.jobs.read().await;
        Ok(JobStatus::ALL
            .iter()
            .map(|s| (*s, jobs.values().filter(|e| e.job.status == *s).count() as i64))
            .collect())
    }
}
