use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::jobs::model::Job;
use crate::jobs::progress::ProgressReporter;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
pub type HandlerResult = Result<Value, JobError>;
type HandlerFn = dyn Fn(Job, ProgressReporter) -> BoxFuture<HandlerResult> + Send + Sync;

/// Failure returned by a handler. `message` is what ends up in the job's
/// `error` field; `code` is for logs.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("HANDLER_ERROR", message)
    }

    pub fn bad_payload(message: impl Into<String>) -> Self {
        Self::new("BAD_PAYLOAD", message)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        Self::new("INTERNAL", e.to_string())
    }
}

/// Decode a job's payload into the handler's own type.
pub fn parse_payload<T: DeserializeOwned>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| JobError::bad_payload(e.to_string()))
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the job if the handler has not finished within `dur`.
    /// Without this a handler may run forever.
    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

#[derive(Clone)]
pub struct HandlerEntry {
    handler: Arc<HandlerFn>,
    timeout: Option<Duration>,
}

impl HandlerEntry {
    /// Run the handler on its own task so a panic surfaces as a `JobError`
    /// instead of unwinding through the scheduler.
    pub async fn run(&self, job: Job, progress: ProgressReporter) -> HandlerResult {
        let mut task = tokio::spawn((self.handler)(job, progress));

        let joined = match self.timeout {
            Some(dur) => match tokio::time::timeout(dur, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(JobError::new(
                        "TIMEOUT",
                        format!("Handler timed out after {}ms", dur.as_millis()),
                    ));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(res) => res,
            Err(e) if e.is_panic() => Err(JobError::new(
                "PANIC",
                format!("handler panicked: {}", panic_message(e.into_panic())),
            )),
            Err(e) => Err(JobError::new("CANCELLED", format!("handler task cancelled: {e}"))),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// job type -> handler. Cheap to clone; clones share the same map, so
/// handlers registered after the scheduler starts are picked up.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, HandlerEntry>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, job_type: &str, handler: F)
    where
        F: Fn(Job, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new());
    }

    pub fn register_with_timeout<F, Fut>(&self, job_type: &str, handler: F, timeout: Duration)
    where
        F: Fn(Job, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new().timeout(timeout));
    }

    /// Last registration for a type wins.
    pub fn register_with_options<F, Fut>(&self, job_type: &str, handler: F, opts: HandlerOptions)
    where
        F: Fn(Job, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed: Arc<HandlerFn> =
            Arc::new(move |job: Job, progress: ProgressReporter| -> BoxFuture<HandlerResult> {
                Box::pin(handler(job, progress))
            });
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                job_type.to_string(),
                HandlerEntry {
                    handler: boxed,
                    timeout: opts.timeout,
                },
            )
            .is_some();

        tracing::info!(job_type, replaced, "registered job handler");
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_type)
            .cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBroadcaster;
    use crate::jobs::memory::MemoryJobStore;
    use crate::jobs::model::NewJob;
    use crate::jobs::store::JobStore;
    use serde::Deserialize;
    use serde_json::json;

    async fn job_and_reporter() -> (Job, ProgressReporter) {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create(NewJob::new("t", json!({"sku": "A-1"}))).await.unwrap();
        let reporter = ProgressReporter::new(job.id, store, EventBroadcaster::new());
        (job, reporter)
    }

    #[test]
    fn last_registration_wins() {
        let registry = HandlerRegistry::new();
        registry.register("t", |_job, _p| async { Ok(json!(1)) });
        registry.register("t", |_job, _p| async { Ok(json!(2)) });

        assert_eq!(registry.job_types(), vec!["t".to_string()]);
        assert!(registry.handler_for("t").is_some());
        assert!(registry.handler_for("missing").is_none());
    }

    #[tokio::test]
    async fn replaced_handler_is_the_one_that_runs() {
        let registry = HandlerRegistry::new();
        registry.register("t", |_job, _p| async { Ok(json!(1)) });
        registry.register("t", |_job, _p| async { Ok(json!(2)) });

        let (job, reporter) = job_and_reporter().await;
        let out = registry.handler_for("t").unwrap().run(job, reporter).await.unwrap();
        assert_eq!(out, json!(2));
    }

    #[tokio::test]
    async fn panics_become_job_errors() {
        let registry = HandlerRegistry::new();
        registry.register("t", |_job, _p| async {
            let shelves: Vec<Value> = Vec::new();
            Ok(shelves[3].clone())
        });

        let (job, reporter) = job_and_reporter().await;
        let err = registry.handler_for("t").unwrap().run(job, reporter).await.unwrap_err();
        assert_eq!(err.code, "PANIC");
        assert!(err.message.starts_with("handler panicked: index out of bounds"));
    }

    #[tokio::test]
    async fn timeout_is_opt_in() {
        let registry = HandlerRegistry::new();
        registry.register_with_timeout(
            "slow",
            |_job, _p| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            },
            Duration::from_millis(20),
        );

        let (job, reporter) = job_and_reporter().await;
        let err = registry.handler_for("slow").unwrap().run(job, reporter).await.unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
        assert_eq!(err.message, "Handler timed out after 20ms");
    }

    #[tokio::test]
    async fn parse_payload_reports_bad_payload() {
        #[derive(Deserialize)]
        struct Lookup {
            sku: String,
        }
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Export {
            path: String,
        }

        let (job, _) = job_and_reporter().await;
        let ok: Lookup = parse_payload(&job).unwrap();
        assert_eq!(ok.sku, "A-1");

        let err = parse_payload::<Export>(&job).unwrap_err();
        assert_eq!(err.code, "BAD_PAYLOAD");
        assert!(err.message.contains("path"));
    }

    #[test]
    fn anyhow_errors_keep_their_message() {
        let err: JobError = anyhow::anyhow!("store unavailable").into();
        assert_eq!(err.to_string(), "store unavailable");
    }
}
