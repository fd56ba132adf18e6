// crates/stockflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::model::{Job, JobFilter, JobPatch, JobStatus, NewJob};
use crate::jobs::store::JobStore;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    job_type: String,
    status: String,
    payload: Value,
    result: Option<Value>,
    error: Option<String>,
    progress: f64,
    total_items: i64,
    completed_items: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> anyhow::Result<Self> {
        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            status: row.status.parse()?,
            payload: row.payload,
            result: row.result,
            error: row.error,
            progress: row.progress,
            total_items: row.total_items,
            completed_items: row.completed_items,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobsRepo {
    pool: PgPool,
}

impl PgJobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One `UPDATE` for both plain and guarded writes; `expected = None`
    /// skips the status check.
    async fn patch(
        &self,
        id: Uuid,
        expected: Option<&[JobStatus]>,
        patch: JobPatch,
    ) -> anyhow::Result<Option<Job>> {
        let JobPatch {
            status,
            result,
            error,
            progress,
            total_items,
            completed_items,
        } = patch;
        let expected: Option<Vec<&str>> =
            expected.map(|statuses| statuses.iter().map(|s| s.as_str()).collect());

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = COALESCE($2, status),
                result = CASE WHEN $3 THEN $4 ELSE result END,
                error = CASE WHEN $5 THEN $6 ELSE error END,
                progress = COALESCE($7, progress),
                total_items = COALESCE($8, total_items),
                completed_items = COALESCE($9, completed_items),
                updated_at = clock_timestamp()
            WHERE id = $1
              AND ($10::text[] IS NULL OR status = ANY($10))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.map(|s| s.as_str()))
        .bind(result.is_some())
        .bind(result.flatten())
        .bind(error.is_some())
        .bind(error.flatten())
        .bind(progress)
        .bind(total_items)
        .bind(completed_items)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }
}

#[async_trait]
impl JobStore for PgJobsRepo {
    // ----------------------------
    // Create
    // ----------------------------

    async fn create(&self, job: NewJob) -> anyhow::Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            WITH t AS (SELECT clock_timestamp() AS ts)
            INSERT INTO jobs (
                id, type, status, payload,
                progress, total_items, completed_items,
                created_at, updated_at
            )
            SELECT $1, $2, 'pending', $3, 0, 0, 0, t.ts, t.ts
            FROM t
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&job.job_type)
        .bind(&job.payload)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    // ----------------------------
    // Reads
    // ----------------------------

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    /// Newest first; ties broken by id (v7 ids sort by creation time).
    /// `LIMIT NULL` is no limit.
    async fn list(&self, filter: &JobFilter) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR type = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.as_deref())
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Single statement, so it is atomic relative to concurrent inserts.
    async fn next_pending(&self) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn count_by_status(&self) -> anyhow::Result<Vec<(JobStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts: Vec<(JobStatus, i64)> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for (status, n) in rows {
            let status: JobStatus = status.parse()?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = n;
            }
        }
        Ok(counts)
    }

    // ----------------------------
    // Mutations
    // ----------------------------

    async fn update(&self, id: Uuid, patch: JobPatch) -> anyhow::Result<Option<Job>> {
        self.patch(id, None, patch).await
    }

    /// The status check sits in the `WHERE`, so a concurrent writer either
    /// lands before it (and the row no longer matches) or after it.
    async fn update_if(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        patch: JobPatch,
    ) -> anyhow::Result<Option<Job>> {
        self.patch(id, Some(expected), patch).await
    }
}
