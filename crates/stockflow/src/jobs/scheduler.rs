use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::events::frame::{
    JobCompleted, JobFailed, JobStarted, EVENT_JOB_COMPLETED, EVENT_JOB_FAILED, EVENT_JOB_STARTED,
};
use crate::events::EventBroadcaster;
use crate::jobs::model::{Job, JobPatch, JobStatus};
use crate::jobs::progress::ProgressReporter;
use crate::jobs::registry::{HandlerRegistry, HandlerResult};
use crate::jobs::store::JobStore;

/// `tokio::time::interval` rejects a zero period.
const MIN_TICK: Duration = Duration::from_millis(1);

/// What a single `run_once` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another step was still in flight; this one was dropped.
    Busy,
    /// Nothing pending.
    Idle,
    Completed(Uuid),
    Failed(Uuid),
}

struct Inner {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    events: EventBroadcaster,
    in_flight: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Releases the single-flight flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Turns pending jobs into finished ones, one at a time, oldest first.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, registry: HandlerRegistry, events: EventBroadcaster) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                events,
                in_flight: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Shorthand for `registry().register(..)`. Last registration wins.
    pub fn register_handler<F, Fut>(&self, job_type: &str, handler: F)
    where
        F: Fn(Job, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.registry.register(job_type, handler);
    }

    pub fn is_busy(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Claim the oldest pending job, run its handler, record the outcome.
    ///
    /// Handler failures are recorded on the job and never returned here.
    /// An `Err` means the store itself failed.
    pub async fn run_once(&self) -> anyhow::Result<RunOutcome> {
        let Some(_guard) = FlightGuard::acquire(&self.inner.in_flight) else {
            return Ok(RunOutcome::Busy);
        };

        // A job cancelled between `next_pending` and the claim is left alone
        // and the next one is tried.
        let (job, entry) = loop {
            let Some(job) = self.inner.store.next_pending().await? else {
                return Ok(RunOutcome::Idle);
            };

            let Some(entry) = self.inner.registry.handler_for(&job.job_type) else {
                let message = format!("No handler registered for type: {}", job.job_type);
                if self.claim(&job, JobPatch::failed(&message)).await?.is_none() {
                    continue;
                }
                tracing::warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
                self.emit_failed(&job, &message);
                return Ok(RunOutcome::Failed(job.id));
            };

            match self.claim(&job, JobPatch::running()).await? {
                Some(job) => break (job, entry),
                None => continue,
            }
        };
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "job started");
        self.inner.events.broadcast(
            EVENT_JOB_STARTED,
            &JobStarted {
                job_id: job.id,
                job_type: &job.job_type,
            },
        );

        let reporter = ProgressReporter::new(
            job.id,
            Arc::clone(&self.inner.store),
            self.inner.events.clone(),
        );

        match entry.run(job.clone(), reporter).await {
            Ok(result) => {
                self.write(job.id, JobPatch::completed(result.clone())).await?;
                tracing::info!(job_id = %job.id, job_type = %job.job_type, "job completed");
                self.inner.events.broadcast(
                    EVENT_JOB_COMPLETED,
                    &JobCompleted {
                        job_id: job.id,
                        result: &result,
                    },
                );
                Ok(RunOutcome::Completed(job.id))
            }
            Err(err) => {
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    code = err.code,
                    error = %err.message,
                    "job failed"
                );
                self.fail(&job, &err.message).await?;
                Ok(RunOutcome::Failed(job.id))
            }
        }
    }

    /// Move a job out of `pending`. `None` if it already left that status.
    async fn claim(&self, job: &Job, patch: JobPatch) -> anyhow::Result<Option<Job>> {
        let claimed = self
            .inner
            .store
            .update_if(job.id, &[JobStatus::Pending], patch)
            .await?;
        if claimed.is_none() {
            tracing::debug!(job_id = %job.id, "job left pending before it was claimed");
        }
        Ok(claimed)
    }

    async fn fail(&self, job: &Job, message: &str) -> anyhow::Result<()> {
        self.write(job.id, JobPatch::failed(message)).await?;
        self.emit_failed(job, message);
        Ok(())
    }

    fn emit_failed(&self, job: &Job, message: &str) {
        self.inner.events.broadcast(
            EVENT_JOB_FAILED,
            &JobFailed {
                job_id: job.id,
                error: message,
            },
        );
    }

    async fn write(&self, id: Uuid, patch: JobPatch) -> anyhow::Result<()> {
        if self.inner.store.update(id, patch).await?.is_none() {
            tracing::warn!(job_id = %id, "job vanished before its outcome was recorded");
        }
        Ok(())
    }

    /// Run `run_once` every `interval`. Restarting replaces the old timer.
    /// Each tick runs on its own task, so a tick that lands while a job is
    /// still in flight finds the guard held and is dropped. Intervals below
    /// 1ms are raised to 1ms.
    pub fn start(&self, interval: Duration) {
        self.stop();
        let interval = interval.max(MIN_TICK);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let scheduler = JobScheduler { inner };
                tokio::spawn(async move {
                    match scheduler.run_once().await {
                        Ok(RunOutcome::Busy) => tracing::trace!("tick skipped, job in flight"),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "scheduler step failed"),
                    }
                });
            }
        });

        *self.inner.timer.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
        tracing::info!(interval_ms = interval.as_millis() as u64, "scheduler started");
    }

    pub fn stop(&self) {
        let previous = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = previous {
            task.abort();
            tracing::info!("scheduler stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::MemoryJobStore;
    use crate::jobs::model::{JobFilter, NewJob};
    use serde_json::json;

    fn scheduler() -> (Arc<MemoryJobStore>, JobScheduler) {
        let store = Arc::new(MemoryJobStore::new());
        let s = JobScheduler::new(store.clone(), HandlerRegistry::new(), EventBroadcaster::new());
        (store, s)
    }

    #[test]
    fn flight_guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let first = FlightGuard::acquire(&flag).unwrap();
        assert!(FlightGuard::acquire(&flag).is_none());
        drop(first);
        assert!(FlightGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn overlapping_step_is_dropped() {
        let (store, s) = scheduler();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        s.registry().register("slow", move |_job, _p| {
            let release_rx = release_rx.clone();
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(json!("done"))
            }
        });
        let a = store.create(NewJob::new("slow", json!({}))).await.unwrap();
        store.create(NewJob::new("slow", json!({}))).await.unwrap();

        let first = tokio::spawn({
            let s = s.clone();
            async move { s.run_once().await }
        });
        while !s.is_busy() {
            tokio::task::yield_now().await;
        }

        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Busy);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), RunOutcome::Completed(a.id));
        assert!(!s.is_busy());
    }

    /// Delegates to a memory store. Can be told to fail every call, or to
    /// cancel the job it hands out from the next `next_pending`.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryJobStore,
        down: AtomicBool,
        cancel_next_peek: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> anyhow::Result<()> {
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl JobStore for FlakyStore {
        async fn create(&self, new: NewJob) -> anyhow::Result<Job> {
            self.check()?;
            self.inner.create(new).await
        }
        async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
            self.check()?;
            self.inner.get(id).await
        }
        async fn list(&self, filter: &JobFilter) -> anyhow::Result<Vec<Job>> {
            self.check()?;
            self.inner.list(filter).await
        }
        async fn update(&self, id: Uuid, patch: JobPatch) -> anyhow::Result<Option<Job>> {
            self.check()?;
            self.inner.update(id, patch).await
        }
        async fn update_if(
            &self,
            id: Uuid,
            expected: &[JobStatus],
            patch: JobPatch,
        ) -> anyhow::Result<Option<Job>> {
            self.check()?;
            self.inner.update_if(id, expected, patch).await
        }
        async fn next_pending(&self) -> anyhow::Result<Option<Job>> {
            self.check()?;
            let job = self.inner.next_pending().await?;
            if let Some(job) = &job {
                if self.cancel_next_peek.swap(false, Ordering::SeqCst) {
                    self.inner.update(job.id, JobPatch::cancelled()).await?;
                }
            }
            Ok(job)
        }
        async fn count_by_status(&self) -> anyhow::Result<Vec<(JobStatus, i64)>> {
            self.check()?;
            self.inner.count_by_status().await
        }
    }

    #[tokio::test]
    async fn store_fault_propagates_and_releases_the_guard() {
        let store = Arc::new(FlakyStore::default());
        let s = JobScheduler::new(store.clone(), HandlerRegistry::new(), EventBroadcaster::new());
        s.registry().register("t", |_job, _p| async { Ok(json!(null)) });
        let job = store.create(NewJob::new("t", json!({}))).await.unwrap();

        store.down.store(true, Ordering::SeqCst);
        let err = s.run_once().await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(!s.is_busy());

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Completed(job.id));
    }

    #[tokio::test]
    async fn job_cancelled_after_peek_is_not_claimed() {
        let store = Arc::new(FlakyStore::default());
        let events = EventBroadcaster::new();
        let s = JobScheduler::new(store.clone(), HandlerRegistry::new(), events.clone());
        let ran = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = ran.clone();
        s.registry().register("t", move |job, _p| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(job.id);
                Ok(json!("done"))
            }
        });
        let a = store.create(NewJob::new("t", json!({}))).await.unwrap();
        let b = store.create(NewJob::new("t", json!({}))).await.unwrap();

        store.cancel_next_peek.store(true, Ordering::SeqCst);
        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Completed(b.id));

        assert_eq!(*ran.lock().unwrap(), vec![b.id]);
        let a = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Cancelled);
        assert!(a.result.is_none());
    }

    #[tokio::test]
    async fn unhandled_job_cancelled_after_peek_stays_cancelled() {
        let store = Arc::new(FlakyStore::default());
        let s = JobScheduler::new(store.clone(), HandlerRegistry::new(), EventBroadcaster::new());
        let job = store.create(NewJob::new("mystery", json!({}))).await.unwrap();

        store.cancel_next_peek.store(true, Ordering::SeqCst);
        assert_eq!(s.run_once().await.unwrap(), RunOutcome::Idle);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn zero_interval_timer_still_runs_jobs() {
        let (store, s) = scheduler();
        s.registry().register("t", |_job, _p| async { Ok(json!(null)) });
        let job = store.create(NewJob::new("t", json!({}))).await.unwrap();

        s.start(Duration::ZERO);
        let mut status = JobStatus::Pending;
        for _ in 0..100 {
            status = store.get(job.id).await.unwrap().unwrap().status;
            if status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        s.stop();
        assert_eq!(status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn timer_drains_the_queue_and_stop_is_idempotent() {
        let (store, s) = scheduler();
        s.registry().register("t", |_job, _p| async { Ok(json!({"ok": true})) });
        let a = store.create(NewJob::new("t", json!({}))).await.unwrap();
        let b = store.create(NewJob::new("t", json!({}))).await.unwrap();

        s.start(Duration::from_millis(10));
        s.start(Duration::from_millis(10));
        assert!(s.is_running());

        for _ in 0..100 {
            let done = store
                .list(&Default::default())
                .await
                .unwrap()
                .iter()
                .all(|j| j.status == JobStatus::Completed);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        s.stop();
        s.stop();
        assert!(!s.is_running());

        for id in [a.id, b.id] {
            assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Completed);
        }
    }
}
