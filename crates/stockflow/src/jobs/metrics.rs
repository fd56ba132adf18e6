use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use crate::events::EventBroadcaster;
use crate::jobs::model::JobStatus;
use crate::jobs::scheduler::JobScheduler;
use crate::jobs::store::JobStore;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    fn set(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Pending => self.pending = n,
            JobStatus::Running => self.running = n,
            JobStatus::Completed => self.completed = n,
            JobStatus::Failed => self.failed = n,
            JobStatus::Cancelled => self.cancelled = n,
        }
    }

    fn iter(&self) -> [(JobStatus, i64); 5] {
        [
            (JobStatus::Pending, self.pending),
            (JobStatus::Running, self.running),
            (JobStatus::Completed, self.completed),
            (JobStatus::Failed, self.failed),
            (JobStatus::Cancelled, self.cancelled),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub at: DateTime<Utc>,
    pub jobs: StatusCounts,
    pub observers: usize,
    pub scheduler_busy: bool,
}

impl Metrics {
    pub async fn collect(
        store: &dyn JobStore,
        scheduler: &JobScheduler,
        events: &EventBroadcaster,
    ) -> anyhow::Result<Self> {
        let mut jobs = StatusCounts::default();
        for (status, n) in store.count_by_status().await? {
            jobs.set(status, n);
        }

        Ok(Self {
            at: Utc::now(),
            jobs,
            observers: events.observer_count(),
            scheduler_busy: scheduler.is_busy(),
        })
    }

    /// Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::from(concat!(
            "# HELP stockflow_jobs Number of jobs by status\n",
            "# TYPE stockflow_jobs gauge\n",
        ));
        for (status, n) in self.jobs.iter() {
            let _ = writeln!(out, "stockflow_jobs{{status=\"{status}\"}} {n}");
        }

        let _ = write!(
            out,
            concat!(
                "# HELP stockflow_observers Connected event stream observers\n",
                "# TYPE stockflow_observers gauge\n",
                "stockflow_observers {}\n",
                "# HELP stockflow_scheduler_busy 1 while a job is being processed\n",
                "# TYPE stockflow_scheduler_busy gauge\n",
                "stockflow_scheduler_busy {}\n",
            ),
            self.observers,
            u8::from(self.scheduler_busy),
        );
        out
    }
}
