pub mod async_submitter;
pub mod batch;
pub mod error;
pub mod job_queue;
pub mod scheduler;
pub mod status;
pub mod submitter;

pub use async_submitter::AsyncHpcSubmitter;
pub use batch::{run_batch, BatchConfig, JobExecutor};
pub use error::{Result, SubmitterError};
pub use job_queue::{JobQueue, Runnable};
pub use scheduler::{HpcJobStatus, HpcScheduler, SubmitResponse, SubmitStatus};
pub use status::HpcStatusCollector;
pub use submitter::{HpcSubmitter, SubmitterParams};
