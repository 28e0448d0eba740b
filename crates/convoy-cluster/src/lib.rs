pub mod closure;
pub mod cluster;
pub mod lock;
pub mod results;

pub use closure::dependency_closure;
pub use cluster::{Cluster, JobStatusUpdate};
pub use lock::FileLock;
pub use results::{ResultsAggregator, ResultsAggregatorSummary};
