use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Unique, filesystem-safe job identifier.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct JobName(pub String);

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobName {
    fn from(s: String) -> Self {
        JobName(s)
    }
}

impl From<&str> for JobName {
    fn from(s: &str) -> Self {
        JobName(s.to_string())
    }
}

impl FromStr for JobName {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(JobName(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    NotSubmitted,
    Submitted,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::NotSubmitted => write!(f, "not_submitted"),
            JobState::Submitted => write!(f, "submitted"),
            JobState::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseJobStateError(pub String);

impl fmt::Display for ParseJobStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid job state: '{}'. Valid values are: not_submitted, submitted, done",
            self.0
        )
    }
}

impl std::error::Error for ParseJobStateError {}

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_submitted" => Ok(JobState::NotSubmitted),
            "submitted" => Ok(JobState::Submitted),
            "done" => Ok(JobState::Done),
            _ => Err(ParseJobStateError(s.to_string())),
        }
    }
}

/// One job in the job table. Owned by the Cluster; mutated only under the
/// cluster lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub name: JobName,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub blocked_by: BTreeSet<JobName>,
    #[serde(default)]
    pub cancel_on_blocking_job_failure: bool,
    #[serde(default)]
    pub state: JobState,
}

impl JobRecord {
    pub fn new(name: impl Into<JobName>) -> Self {
        Self {
            name: name.into(),
            blocked_by: BTreeSet::new(),
            cancel_on_blocking_job_failure: false,
            state: JobState::NotSubmitted,
        }
    }

    pub fn with_blocking_jobs<I, N>(name: impl Into<JobName>, blocking: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<JobName>,
    {
        Self {
            name: name.into(),
            blocked_by: blocking.into_iter().map(Into::into).collect(),
            cancel_on_blocking_job_failure: false,
            state: JobState::NotSubmitted,
        }
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked_by.is_empty()
    }
}

fn default_per_node_batch_size() -> usize {
    64
}

fn default_queue_depth() -> usize {
    4
}

fn default_poll_interval_s() -> u64 {
    10
}

fn default_node_runner_command() -> String {
    "convoy-node".to_string()
}

/// A named set of submission parameters, persisted inside the cluster
/// state so every node uses the same tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionGroup {
    pub name: String,
    #[serde(default = "default_per_node_batch_size")]
    pub per_node_batch_size: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,
    #[serde(default)]
    pub try_add_blocked_jobs: bool,
    #[serde(default = "default_node_runner_command")]
    pub node_runner_command: String,
}

impl Default for SubmissionGroup {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            per_node_batch_size: default_per_node_batch_size(),
            queue_depth: default_queue_depth(),
            poll_interval_s: default_poll_interval_s(),
            try_add_blocked_jobs: false,
            node_runner_command: default_node_runner_command(),
        }
    }
}

/// Cluster-wide state persisted to `cluster_config.json`.
///
/// Invariants: `completed_jobs <= num_jobs`, `submitted_jobs` and
/// `completed_jobs` are monotonic non-decreasing between resubmissions,
/// and at most one node has a non-empty `submitter` at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterState {
    /// Hostname of the current submitter, or empty if no node holds the role.
    #[serde(default)]
    pub submitter: String,
    pub path: PathBuf,
    pub num_jobs: usize,
    #[serde(default)]
    pub submitted_jobs: usize,
    #[serde(default)]
    pub completed_jobs: usize,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub is_canceled: bool,
    pub version: u64,
    #[serde(default)]
    pub submission_groups: Vec<SubmissionGroup>,
}

impl ClusterState {
    pub fn has_submitter(&self) -> bool {
        !self.submitter.is_empty()
    }
}

/// The job table plus submission bookkeeping, persisted to
/// `job_status.json` with its own version counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusState {
    pub jobs: Vec<JobRecord>,
    #[serde(default)]
    pub hpc_job_ids: Vec<String>,
    #[serde(default)]
    pub batch_index: usize,
    pub version: u64,
}

impl JobStatusState {
    pub fn find_job(&self, name: &JobName) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| &j.name == name)
    }

    pub fn find_job_mut(&mut self, name: &JobName) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| &j.name == name)
    }

    pub fn done_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Done)
            .count()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Finished,
    Canceled,
    Missing,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Finished => write!(f, "finished"),
            ResultStatus::Canceled => write!(f, "canceled"),
            ResultStatus::Missing => write!(f, "missing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResultStatusError(pub String);

impl fmt::Display for ParseResultStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid result status: '{}'. Valid values are: finished, canceled, missing",
            self.0
        )
    }
}

impl std::error::Error for ParseResultStatusError {}

impl FromStr for ResultStatus {
    type Err = ParseResultStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "finished" => Ok(ResultStatus::Finished),
            "canceled" => Ok(ResultStatus::Canceled),
            "missing" => Ok(ResultStatus::Missing),
            _ => Err(ParseResultStatusError(s.to_string())),
        }
    }
}

/// Completion record for one job. Immutable once written; appended by the
/// worker that ran the job and consumed by the submitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub name: JobName,
    pub return_code: i32,
    pub status: ResultStatus,
    pub exec_time_s: f64,
    pub completion_time: DateTime<Utc>,
    pub hpc_job_id: String,
}

impl JobResult {
    pub fn new(
        name: impl Into<JobName>,
        return_code: i32,
        status: ResultStatus,
        exec_time_s: f64,
        hpc_job_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            return_code,
            status,
            exec_time_s,
            completion_time: Utc::now(),
            hpc_job_id: hpc_job_id.into(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == ResultStatus::Finished && self.return_code == 0
    }
}
