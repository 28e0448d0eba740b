pub mod fixture;
pub mod sim;

pub use fixture::ClusterFixture;
pub use sim::{exec_batch_script, ExitCodeExecutor, SimScheduler};
