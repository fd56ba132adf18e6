pub mod memory;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod registry;
pub mod repo;
pub mod scheduler;
pub mod store;

pub use memory::MemoryJobStore;
pub use metrics::{Metrics, StatusCounts};
pub use model::{Job, JobFilter, JobPatch, JobStatus, NewJob};
pub use progress::ProgressReporter;
pub use registry::{parse_payload, HandlerOptions, HandlerRegistry, HandlerResult, JobError};
pub use repo::PgJobsRepo;
pub use scheduler::{JobScheduler, RunOutcome};
pub use store::JobStore;
