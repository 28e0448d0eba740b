use convoy_cluster::ResultsAggregator;
use convoy_core::constants::{dirs, files};
use convoy_core::model::JobRecord;
use convoy_submitter::batch::BatchConfig;
use convoy_submitter::{
    run_batch, HpcJobStatus, HpcScheduler, JobExecutor, JobQueue, SubmitResponse, SubmitStatus,
};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SubmitHook =
    Box<dyn Fn(&Path, &str) -> convoy_submitter::Result<()> + Send + Sync>;

/// In-memory stand-in for an external scheduler backend. Submissions get
/// sequential job IDs and sit QUEUED until the test drives them with
/// `complete` / `forget`, or a submit hook runs each batch synchronously
/// (and the submission turns COMPLETE on its own).
pub struct SimScheduler {
    inner: Mutex<Inner>,
    on_submit: Option<SubmitHook>,
}

struct Inner {
    next_id: u64,
    statuses: HashMap<String, HpcJobStatus>,
    scripts: Vec<PathBuf>,
    reject: bool,
}

impl SimScheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1000,
                statuses: HashMap::new(),
                scripts: Vec::new(),
                reject: false,
            }),
            on_submit: None,
        }
    }

    /// Runs `hook(script, hpc_job_id)` on every submission; the
    /// submission reports COMPLETE once the hook returns.
    pub fn with_submit_hook(
        hook: impl Fn(&Path, &str) -> convoy_submitter::Result<()> + Send + Sync + 'static,
    ) -> Self {
        let mut scheduler = Self::new();
        scheduler.on_submit = Some(Box::new(hook));
        scheduler
    }

    pub fn set_reject(&self, reject: bool) {
        self.inner.lock().unwrap().reject = reject;
    }

    pub fn set_status(&self, job_id: &str, status: HpcJobStatus) {
        self.inner
            .lock()
            .unwrap()
            .statuses
            .insert(job_id.to_string(), status);
    }

    pub fn complete(&self, job_id: &str) {
        self.set_status(job_id, HpcJobStatus::Complete);
    }

    /// Drops a job from the status map entirely, so queries report NONE.
    pub fn forget(&self, job_id: &str) {
        self.inner.lock().unwrap().statuses.remove(job_id);
    }

    pub fn submitted_scripts(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().scripts.clone()
    }
}

impl Default for SimScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl HpcScheduler for SimScheduler {
    fn submit(&self, script: &Path) -> convoy_submitter::Result<SubmitResponse> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            if inner.reject {
                return Ok(SubmitResponse {
                    status: SubmitStatus::Error,
                    job_id: None,
                    stderr: "submission rejected".to_string(),
                });
            }
            inner.next_id += 1;
            let id = inner.next_id.to_string();
            inner.scripts.push(script.to_path_buf());
            inner.statuses.insert(id.clone(), HpcJobStatus::Queued);
            id
        };

        if let Some(hook) = &self.on_submit {
            hook(script, &id)?;
            self.complete(&id);
        }

        Ok(SubmitResponse {
            status: SubmitStatus::Ok,
            job_id: Some(id),
            stderr: String::new(),
        })
    }

    fn check_status(&self, job_id: &str) -> convoy_submitter::Result<HpcJobStatus> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .statuses
            .get(job_id)
            .copied()
            .unwrap_or(HpcJobStatus::None))
    }

    fn check_statuses(&self) -> convoy_submitter::Result<HashMap<String, HpcJobStatus>> {
        Ok(self.inner.lock().unwrap().statuses.clone())
    }

    fn cancel_job(&self, job_id: &str) -> convoy_submitter::Result<i32> {
        self.inner.lock().unwrap().statuses.remove(job_id);
        Ok(0)
    }
}

/// Executor whose jobs exit 0 unless named in `failing`.
pub struct ExitCodeExecutor {
    pub failing: BTreeSet<String>,
}

impl JobExecutor for ExitCodeExecutor {
    fn execute(&self, job: &JobRecord) -> convoy_submitter::Result<i32> {
        Ok(if self.failing.contains(&job.name.0) { 1 } else { 0 })
    }
}

/// Executes the batch behind a generated run script the way a node
/// would: loads the batch config next to the script and runs it against
/// the submission's results directory.
pub fn exec_batch_script(
    script: &Path,
    hpc_job_id: &str,
    failing: &BTreeSet<String>,
) -> convoy_submitter::Result<()> {
    let stem = script
        .file_stem()
        .expect("run script has no file stem")
        .to_string_lossy();
    let batch_index: usize = stem
        .trim_start_matches("run_batch_")
        .parse()
        .expect("run script name carries no batch index");

    let dir = script.parent().expect("run script has no parent directory");
    let config = BatchConfig::load(&dir.join(files::batch_config_name(batch_index)))?;
    let aggregator = ResultsAggregator::new(
        dir.join(dirs::RESULTS)
            .join(files::results_file_name(batch_index)),
    );

    run_batch(
        &config,
        Arc::new(ExitCodeExecutor {
            failing: failing.clone(),
        }),
        &aggregator,
        hpc_job_id,
        JobQueue::default_depth(),
        Duration::from_millis(1),
    )
}
