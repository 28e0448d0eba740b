use crate::error::{Result, SubmitterError};
use crate::job_queue::{JobQueue, Runnable};
use convoy_cluster::ResultsAggregator;
use convoy_core::model::{JobRecord, JobResult, ResultStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The job subset handed to one node, serialized to
/// `config_batch_<n>.json` and consumed by the per-node runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_index: usize,
    pub jobs: Vec<JobRecord>,
}

impl BatchConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(convoy_core::errors::CoordinationError::from)?;
        fs_err::write(path, json).map_err(convoy_core::errors::CoordinationError::from)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs_err::read_to_string(path).map_err(convoy_core::errors::CoordinationError::from)?;
        let config = serde_json::from_str(&content)
            .map_err(convoy_core::errors::CoordinationError::from)?;
        Ok(config)
    }
}

/// How one job actually runs. This is the seam for the pluggable job
/// extension system: implementations build the command line or execution
/// class and report the process return code.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, job: &JobRecord) -> Result<i32>;
}

struct LocalJobRunner {
    job: JobRecord,
    executor: Arc<dyn JobExecutor>,
    aggregator: ResultsAggregator,
    hpc_job_id: String,
    blocking: BTreeSet<String>,
    handle: Option<JoinHandle<Result<i32>>>,
    started_at: Option<Instant>,
    finished: bool,
}

impl Runnable for LocalJobRunner {
    fn name(&self) -> &str {
        &self.job.name.0
    }

    fn run(&mut self) -> Result<()> {
        let executor = Arc::clone(&self.executor);
        let job = self.job.clone();
        self.started_at = Some(Instant::now());
        self.handle = Some(std::thread::spawn(move || executor.execute(&job)));
        Ok(())
    }

    fn is_complete(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(true);
        }
        let done = self.handle.as_ref().map(JoinHandle::is_finished) == Some(true);
        if !done {
            return Ok(false);
        }

        let handle = self.handle.take().expect("handle checked above");
        let return_code = handle
            .join()
            .map_err(|_| {
                SubmitterError::Execution(self.job.name.clone(), "executor panicked".to_string())
            })??;
        let exec_time_s = self
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let result = JobResult::new(
            self.job.name.clone(),
            return_code,
            ResultStatus::Finished,
            exec_time_s,
            self.hpc_job_id.clone(),
        );
        self.aggregator.append_result(&result)?;
        tracing::info!(job = %self.job.name, return_code, "job finished");
        self.finished = true;
        Ok(true)
    }

    fn blocking_jobs(&self) -> &BTreeSet<String> {
        &self.blocking
    }

    fn remove_blocking_job(&mut self, name: &str) {
        self.blocking.remove(name);
    }
}

/// Runs a batch's jobs concurrently on this node and appends one result
/// row per job. Blocking sets are reduced to in-batch names first; the
/// submitter only ever co-batches a job with its blockers, so anything
/// else already completed.
pub fn run_batch(
    config: &BatchConfig,
    executor: Arc<dyn JobExecutor>,
    aggregator: &ResultsAggregator,
    hpc_job_id: &str,
    max_queue_depth: usize,
    poll_interval: Duration,
) -> Result<()> {
    let batch_names: BTreeSet<String> = config.jobs.iter().map(|j| j.name.0.clone()).collect();

    let units: Vec<Box<dyn Runnable>> = config
        .jobs
        .iter()
        .map(|job| {
            let blocking = job
                .blocked_by
                .iter()
                .map(|n| n.0.clone())
                .filter(|n| batch_names.contains(n))
                .collect();
            Box::new(LocalJobRunner {
                job: job.clone(),
                executor: Arc::clone(&executor),
                aggregator: aggregator.clone(),
                hpc_job_id: hpc_job_id.to_string(),
                blocking,
                handle: None,
                started_at: None,
                finished: false,
            }) as Box<dyn Runnable>
        })
        .collect();

    tracing::info!(
        batch_index = config.batch_index,
        num_jobs = config.jobs.len(),
        "running batch"
    );
    JobQueue::new(max_queue_depth, poll_interval).run_jobs(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::model::JobName;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingExecutor {
        order: Mutex<Vec<String>>,
        fail: BTreeSet<String>,
    }

    impl JobExecutor for RecordingExecutor {
        fn execute(&self, job: &JobRecord) -> Result<i32> {
            self.order.lock().unwrap().push(job.name.0.clone());
            Ok(if self.fail.contains(&job.name.0) { 1 } else { 0 })
        }
    }

    #[test]
    fn test_batch_config_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config_batch_0.json");
        let config = BatchConfig {
            batch_index: 0,
            jobs: vec![
                JobRecord::new("a"),
                JobRecord::with_blocking_jobs("b", ["a"]),
            ],
        };
        config.save(&path).unwrap();
        assert_eq!(BatchConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_run_batch_appends_one_result_per_job() {
        let dir = tempdir().unwrap();
        let aggregator = ResultsAggregator::new(dir.path().join("results_batch_0.csv"));
        let executor = Arc::new(RecordingExecutor {
            order: Mutex::new(Vec::new()),
            fail: ["b"].iter().map(|s| s.to_string()).collect(),
        });

        let config = BatchConfig {
            batch_index: 0,
            jobs: vec![JobRecord::new("a"), JobRecord::new("b")],
        };
        run_batch(
            &config,
            executor,
            &aggregator,
            "hpc-1",
            2,
            Duration::from_millis(1),
        )
        .unwrap();

        let mut results = aggregator.get_results().unwrap();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(results.len(), 2);
        assert!(results[0].is_successful());
        assert_eq!(results[1].return_code, 1);
        assert_eq!(results[1].hpc_job_id, "hpc-1");
        assert!(dir.path().join("a").exists());
        assert!(dir.path().join("b").exists());
    }

    #[test]
    fn test_in_batch_blocker_runs_first() {
        let dir = tempdir().unwrap();
        let aggregator = ResultsAggregator::new(dir.path().join("results_batch_0.csv"));
        let executor = Arc::new(RecordingExecutor {
            order: Mutex::new(Vec::new()),
            fail: BTreeSet::new(),
        });

        let config = BatchConfig {
            batch_index: 0,
            jobs: vec![
                JobRecord::new("first"),
                JobRecord::with_blocking_jobs("second", ["first"]),
            ],
        };
        run_batch(
            &config,
            Arc::clone(&executor) as Arc<dyn JobExecutor>,
            &aggregator,
            "hpc-1",
            4,
            Duration::from_millis(1),
        )
        .unwrap();

        let order = executor.order.lock().unwrap().clone();
        assert_eq!(order, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_out_of_batch_blockers_are_ignored() {
        let dir = tempdir().unwrap();
        let aggregator = ResultsAggregator::new(dir.path().join("results_batch_1.csv"));
        let executor = Arc::new(RecordingExecutor {
            order: Mutex::new(Vec::new()),
            fail: BTreeSet::new(),
        });

        // "ancestor" completed in an earlier batch; it must not stall this one.
        let config = BatchConfig {
            batch_index: 1,
            jobs: vec![JobRecord::with_blocking_jobs("only", ["ancestor"])],
        };
        run_batch(
            &config,
            executor,
            &aggregator,
            "hpc-2",
            1,
            Duration::from_millis(1),
        )
        .unwrap();

        assert_eq!(aggregator.get_results().unwrap().len(), 1);
    }

    #[test]
    fn test_executor_result_name_matches_job() {
        let dir = tempdir().unwrap();
        let aggregator = ResultsAggregator::new(dir.path().join("r.csv"));
        let executor = Arc::new(RecordingExecutor {
            order: Mutex::new(Vec::new()),
            fail: BTreeSet::new(),
        });

        let config = BatchConfig {
            batch_index: 0,
            jobs: vec![JobRecord::new("solo")],
        };
        run_batch(
            &config,
            executor,
            &aggregator,
            "",
            1,
            Duration::from_millis(1),
        )
        .unwrap();

        let results = aggregator.get_results().unwrap();
        assert_eq!(results[0].name, JobName::from("solo"));
    }
}
