use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Status of one external scheduler job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HpcJobStatus {
    Unknown,
    /// The scheduler has no memory of this job. Terminal: retrying the
    /// query indefinitely would hang the submitter.
    None,
    Queued,
    Running,
    Complete,
}

impl fmt::Display for HpcJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HpcJobStatus::Unknown => write!(f, "unknown"),
            HpcJobStatus::None => write!(f, "none"),
            HpcJobStatus::Queued => write!(f, "queued"),
            HpcJobStatus::Running => write!(f, "running"),
            HpcJobStatus::Complete => write!(f, "complete"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SubmitStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone)]
pub struct SubmitResponse {
    pub status: SubmitStatus,
    pub job_id: Option<String>,
    pub stderr: String,
}

/// Abstract scheduler adapter. Each backend (SLURM, PBS, local, fake) is
/// a strategy object selected once at startup and injected wherever
/// submissions happen; this crate never parses backend-specific output.
pub trait HpcScheduler: Send + Sync {
    /// Submits a generated run script, returning the outcome and the
    /// external job ID on success.
    fn submit(&self, script: &Path) -> Result<SubmitResponse>;

    /// Status of a single external job.
    fn check_status(&self, job_id: &str) -> Result<HpcJobStatus>;

    /// Statuses of every job this scheduler currently knows about. One
    /// call covers the whole cluster; see `HpcStatusCollector` for the
    /// caching layer that amortizes it.
    fn check_statuses(&self) -> Result<HashMap<String, HpcJobStatus>>;

    /// Cancels an external job, returning the backend's exit code.
    fn cancel_job(&self, job_id: &str) -> Result<i32>;
}
