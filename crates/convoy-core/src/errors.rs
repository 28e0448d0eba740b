use std::path::PathBuf;
use thiserror::Error;

/// Recoverable errors of the coordination layer. Internal-consistency
/// violations (count mismatches, closure non-convergence, double-submit
/// transitions) are deliberately not represented here: they abort the
/// process via assertions because the shared state can no longer be
/// trusted.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse state file: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "Stale cluster config write: on-disk version is {actual}, caller observed {expected}. \
         Another node updated the state; re-read before retrying."
    )]
    ClusterConfigVersionMismatch { expected: u64, actual: u64 },

    #[error(
        "Stale job status write: on-disk version is {actual}, caller observed {expected}. \
         Another node updated the state; re-read before retrying."
    )]
    JobStatusVersionMismatch { expected: u64, actual: u64 },

    #[error(
        "Timed out after {timeout_s}s acquiring lock '{path}'. \
         Another node may be wedged while holding it."
    )]
    LockTimeout { path: PathBuf, timeout_s: u64 },

    #[error("Malformed results row in '{path}': {line}")]
    MalformedResultRow { path: PathBuf, line: String },

    #[error("No cluster exists at '{0}'. Expected 'cluster_config.json' in that directory.")]
    ClusterNotFound(PathBuf),

    #[error("Invalid cluster state: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
