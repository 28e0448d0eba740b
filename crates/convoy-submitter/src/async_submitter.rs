use crate::error::{Result, SubmitterError};
use crate::job_queue::Runnable;
use crate::scheduler::{HpcJobStatus, HpcScheduler, SubmitStatus};
use crate::status::HpcStatusCollector;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// One batch submission to the external scheduler: PENDING from `run`
/// until the scheduler reports the job COMPLETE, or NONE (forgotten jobs
/// are terminal, not retried).
pub struct AsyncHpcSubmitter {
    name: String,
    script: PathBuf,
    scheduler: Arc<dyn HpcScheduler>,
    collector: Arc<Mutex<HpcStatusCollector>>,
    hpc_job_id: Option<String>,
    no_blockers: BTreeSet<String>,
}

impl AsyncHpcSubmitter {
    pub fn new(
        name: impl Into<String>,
        script: impl Into<PathBuf>,
        scheduler: Arc<dyn HpcScheduler>,
        collector: Arc<Mutex<HpcStatusCollector>>,
    ) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            scheduler,
            collector,
            hpc_job_id: None,
            no_blockers: BTreeSet::new(),
        }
    }

    /// The external scheduler job ID, once submitted.
    pub fn hpc_job_id(&self) -> Option<&str> {
        self.hpc_job_id.as_deref()
    }
}

impl Runnable for AsyncHpcSubmitter {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self) -> Result<()> {
        let response = self.scheduler.submit(&self.script)?;
        match response.status {
            SubmitStatus::Ok => {
                let job_id = response.job_id.ok_or_else(|| {
                    SubmitterError::SchedulerQuery(
                        "scheduler reported success without a job ID".to_string(),
                    )
                })?;
                tracing::info!(
                    batch = %self.name,
                    hpc_job_id = %job_id,
                    script = %self.script.display(),
                    "submitted batch to scheduler"
                );
                self.hpc_job_id = Some(job_id);
                Ok(())
            }
            SubmitStatus::Error => Err(SubmitterError::SubmissionFailed {
                script: self.script.clone(),
                stderr: response.stderr,
            }),
        }
    }

    fn is_complete(&mut self) -> Result<bool> {
        let Some(job_id) = self.hpc_job_id.clone() else {
            return Ok(false);
        };
        let status = self
            .collector
            .lock()
            .expect("status collector mutex must not be poisoned")
            .status(&job_id)?;
        Ok(matches!(status, HpcJobStatus::Complete | HpcJobStatus::None))
    }

    fn blocking_jobs(&self) -> &BTreeSet<String> {
        &self.no_blockers
    }

    fn remove_blocking_job(&mut self, _name: &str) {}
}
