use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::events::frame::{JobProgressed, EVENT_JOB_PROGRESS};
use crate::events::EventBroadcaster;
use crate::jobs::model::{JobPatch, JobStatus};
use crate::jobs::store::JobStore;

/// Handed to a running handler so it can report how far along it is.
///
/// Every report is written to the store first and only then broadcast, so an
/// observer never sees progress the store does not have.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    store: Arc<dyn JobStore>,
    events: EventBroadcaster,
    high_water: Arc<Mutex<f64>>,
}

impl ProgressReporter {
    pub fn new(job_id: Uuid, store: Arc<dyn JobStore>, events: EventBroadcaster) -> Self {
        Self {
            job_id,
            store,
            events,
            high_water: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Persist `progress` (percent) and `completed_items`, then emit
    /// `job:progress`. Progress is clamped to [0, 100] and never goes
    /// backwards for the lifetime of this reporter.
    pub async fn report(&self, progress: f64, completed_items: i64) -> anyhow::Result<()> {
        let progress = {
            let mut high = self.high_water.lock().unwrap_or_else(|p| p.into_inner());
            if progress.is_finite() {
                *high = high.max(progress.clamp(0.0, 100.0));
            }
            *high
        };

        let updated = self
            .store
            .update(self.job_id, JobPatch::progress(progress, completed_items))
            .await?;
        if updated.is_none() {
            anyhow::bail!("job {} no longer exists", self.job_id);
        }

        self.events.broadcast(
            EVENT_JOB_PROGRESS,
            &JobProgressed {
                job_id: self.job_id,
                progress,
                completed_items,
            },
        );
        Ok(())
    }

    /// Record how many units of work the job has in total. No event.
    pub async fn set_total_items(&self, total_items: i64) -> anyhow::Result<()> {
        self.store
            .update(self.job_id, JobPatch::total_items(total_items))
            .await?
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("job {} no longer exists", self.job_id))
    }

    /// Whether someone has labelled this job `cancelled` since it started.
    /// Advisory only: the scheduler records the handler's outcome either way.
    pub async fn is_cancelled(&self) -> anyhow::Result<bool> {
        Ok(self
            .store
            .get(self.job_id)
            .await?
            .is_some_and(|job| job.status == JobStatus::Cancelled))
    }
}
