use crate::async_submitter::AsyncHpcSubmitter;
use crate::batch::BatchConfig;
use crate::error::Result;
use crate::job_queue::Runnable;
use crate::scheduler::HpcScheduler;
use crate::status::HpcStatusCollector;
use convoy_cluster::{Cluster, JobStatusUpdate, ResultsAggregator, ResultsAggregatorSummary};
use convoy_core::constants::{dirs, files};
use convoy_core::model::{JobName, JobRecord, JobResult, JobState, ResultStatus, SubmissionGroup};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Tuning knobs for one submission run, usually taken from the cluster's
/// active `SubmissionGroup`.
#[derive(Debug, Clone)]
pub struct SubmitterParams {
    /// Maximum jobs per batch handed to one node.
    pub per_node_batch_size: usize,
    /// Maximum concurrently in-flight batch submissions. Throttles
    /// pressure on the external scheduler, independent of batch size.
    pub queue_depth: usize,
    pub poll_interval: Duration,
    /// Allow a job into a batch when all of its blockers are already in
    /// that same batch; the node-local queue then serializes them.
    pub try_add_blocked_jobs: bool,
    pub node_runner_command: String,
}

impl From<&SubmissionGroup> for SubmitterParams {
    fn from(group: &SubmissionGroup) -> Self {
        Self {
            per_node_batch_size: group.per_node_batch_size,
            queue_depth: group.queue_depth,
            poll_interval: Duration::from_secs(group.poll_interval_s),
            try_add_blocked_jobs: group.try_add_blocked_jobs,
            node_runner_command: group.node_runner_command.clone(),
        }
    }
}

impl Default for SubmitterParams {
    fn default() -> Self {
        (&SubmissionGroup::default()).into()
    }
}

/// Dependency-aware batch scheduler. Runs on the single node holding the
/// submitter role and drives the whole submission to completion: forms
/// batches of unblocked jobs, submits them through the scheduler adapter,
/// observes completion markers, and folds every transition back into the
/// shared cluster state.
pub struct HpcSubmitter<'a> {
    cluster: &'a mut Cluster,
    scheduler: Arc<dyn HpcScheduler>,
    params: SubmitterParams,
}

impl<'a> HpcSubmitter<'a> {
    pub fn new(
        cluster: &'a mut Cluster,
        scheduler: Arc<dyn HpcScheduler>,
        params: SubmitterParams,
    ) -> Self {
        Self {
            cluster,
            scheduler,
            params,
        }
    }

    /// Runs scheduling cycles until every remaining job has been placed
    /// into a batch (or canceled) and every outstanding submission has
    /// reached a terminal scheduler status.
    pub fn run(&mut self) -> Result<()> {
        assert!(
            self.cluster.is_submitter(),
            "only the submitter node may schedule batches"
        );

        let path = self.cluster.path().to_path_buf();
        let results_dir = path.join(dirs::RESULTS);
        let mut summary = ResultsAggregatorSummary::new(&results_dir);
        let collector = Arc::new(Mutex::new(HpcStatusCollector::new(
            Arc::clone(&self.scheduler),
            self.params.poll_interval,
        )));

        let mut remaining = self.cluster.remaining_jobs();
        let mut batch_index = self
            .cluster
            .job_status()
            .map(|s| s.batch_index)
            .unwrap_or(0);
        let start_index = batch_index;
        let initial_remaining = remaining.len();

        // Completions already folded into the job table; marker signals
        // for these names must not be folded a second time.
        let mut reported: BTreeSet<JobName> = self
            .cluster
            .job_status()
            .map(|s| {
                s.jobs
                    .iter()
                    .filter(|j| j.state == JobState::Done)
                    .map(|j| j.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        let mut outstanding: Vec<AsyncHpcSubmitter> = Vec::new();
        let mut placed = 0usize;
        let mut canceled_total = 0usize;

        loop {
            let completed = summary.update_completed_jobs()?.clone();
            let newly: Vec<JobName> = completed.difference(&reported).cloned().collect();

            let canceled =
                self.cancel_doomed_jobs(&mut remaining, &summary, batch_index, &results_dir)?;
            canceled_total += canceled.len();

            reported.extend(newly.iter().cloned());
            reported.extend(canceled.iter().cloned());
            for job in &mut remaining {
                job.blocked_by.retain(|name| !reported.contains(name));
            }

            sweep_outstanding(&mut outstanding)?;

            let batch = if outstanding.len() < self.params.queue_depth {
                self.form_batch(&mut remaining)
            } else {
                Vec::new()
            };
            let batch_formed = !batch.is_empty();
            let mut submitted = Vec::new();

            if batch_formed {
                tracing::info!(
                    batch_index,
                    batch_size = batch.len(),
                    blocked = remaining.iter().filter(|j| j.is_blocked()).count(),
                    "formed batch"
                );
                submitted = batch.iter().map(|j| j.name.clone()).collect();
                placed += batch.len();
                outstanding.push(self.submit_batch(&path, batch_index, batch, &collector)?);
                batch_index += 1;
            }

            if batch_formed || !newly.is_empty() || !canceled.is_empty() {
                self.cluster.update_job_status(&JobStatusUpdate {
                    submitted,
                    blocked: remaining.iter().filter(|j| j.is_blocked()).cloned().collect(),
                    canceled,
                    completed: newly,
                    hpc_job_ids: outstanding_ids(&outstanding),
                    next_batch_index: batch_index,
                })?;
            }

            if remaining.is_empty() && outstanding.is_empty() {
                break;
            }
            if !batch_formed {
                thread::sleep(self.params.poll_interval);
            }
        }

        assert_eq!(
            placed + canceled_total,
            initial_remaining,
            "scheduled {} and canceled {} of {} remaining jobs",
            placed,
            canceled_total,
            initial_remaining
        );

        // Markers from the last batch may land after its submission turns
        // terminal; fold the stragglers before deciding completeness.
        let completed = summary.update_completed_jobs()?.clone();
        let newly: Vec<JobName> = completed.difference(&reported).cloned().collect();
        if !newly.is_empty() {
            self.cluster.update_job_status(&JobStatusUpdate {
                completed: newly,
                next_batch_index: batch_index,
                ..Default::default()
            })?;
        }

        let state = self.cluster.state();
        tracing::info!(
            completed_jobs = state.completed_jobs,
            batches = batch_index - start_index,
            canceled = canceled_total,
            "submission run finished"
        );

        if self.cluster.state().completed_jobs == self.cluster.state().num_jobs {
            self.cluster.mark_complete(false)?;
        } else {
            tracing::warn!(
                completed_jobs = self.cluster.state().completed_jobs,
                num_jobs = self.cluster.state().num_jobs,
                "not all jobs completed; cluster left open"
            );
        }
        Ok(())
    }

    /// Greedily fills one batch from the remaining list, in order. A job
    /// is eligible when its blocking set is empty, or when every blocker
    /// already sits in this batch and `try_add_blocked_jobs` is on.
    fn form_batch(&self, remaining: &mut Vec<JobRecord>) -> Vec<JobRecord> {
        let mut batch = Vec::new();
        let mut batch_names: BTreeSet<JobName> = BTreeSet::new();
        let mut kept = Vec::new();

        for job in remaining.drain(..) {
            let eligible = batch.len() < self.params.per_node_batch_size
                && (job.blocked_by.is_empty()
                    || (self.params.try_add_blocked_jobs
                        && job.blocked_by.iter().all(|b| batch_names.contains(b))));
            if eligible {
                batch_names.insert(job.name.clone());
                batch.push(job);
            } else {
                kept.push(job);
            }
        }

        *remaining = kept;
        batch
    }

    fn submit_batch(
        &self,
        path: &Path,
        batch_index: usize,
        jobs: Vec<JobRecord>,
        collector: &Arc<Mutex<HpcStatusCollector>>,
    ) -> Result<AsyncHpcSubmitter> {
        let config_path = path.join(files::batch_config_name(batch_index));
        BatchConfig { batch_index, jobs }.save(&config_path)?;

        let script_path = path.join(files::run_script_name(batch_index));
        write_run_script(&script_path, &self.params.node_runner_command, &config_path)?;

        let mut unit = AsyncHpcSubmitter::new(
            format!("batch_{}", batch_index),
            script_path,
            Arc::clone(&self.scheduler),
            Arc::clone(collector),
        );
        unit.run()?;
        Ok(unit)
    }

    /// Cancels still-waiting jobs whose blockers failed, when flagged to
    /// do so. Each canceled job gets a CANCELED result row so reports and
    /// later cascades see it; MISSING and CANCELED blockers count as
    /// failed.
    fn cancel_doomed_jobs(
        &self,
        remaining: &mut Vec<JobRecord>,
        summary: &ResultsAggregatorSummary,
        batch_index: usize,
        results_dir: &Path,
    ) -> Result<Vec<JobName>> {
        if !remaining
            .iter()
            .any(|j| j.cancel_on_blocking_job_failure && j.is_blocked())
        {
            return Ok(Vec::new());
        }

        let mut failed: BTreeSet<JobName> = summary
            .get_results()?
            .into_iter()
            .filter(|r| !r.is_successful())
            .map(|r| r.name)
            .collect();
        if failed.is_empty() {
            return Ok(Vec::new());
        }

        // A cancellation is itself a failure, so it can doom further
        // flagged dependents; rescan until nothing new is doomed.
        let mut canceled = Vec::new();
        loop {
            let mut doomed_this_pass = Vec::new();
            remaining.retain(|job| {
                let doomed = job.cancel_on_blocking_job_failure
                    && job.blocked_by.iter().any(|b| failed.contains(b));
                if doomed {
                    doomed_this_pass.push(job.name.clone());
                }
                !doomed
            });
            if doomed_this_pass.is_empty() {
                break;
            }
            failed.extend(doomed_this_pass.iter().cloned());
            canceled.extend(doomed_this_pass);
        }

        let aggregator =
            ResultsAggregator::new(results_dir.join(files::results_file_name(batch_index)));
        for name in &canceled {
            tracing::warn!(job = %name, "canceling job after blocking job failure");
            aggregator.append_result(&JobResult::new(
                name.clone(),
                -1,
                ResultStatus::Canceled,
                0.0,
                "",
            ))?;
        }
        Ok(canceled)
    }
}

fn outstanding_ids(outstanding: &[AsyncHpcSubmitter]) -> Vec<String> {
    outstanding
        .iter()
        .filter_map(|u| u.hpc_job_id().map(String::from))
        .collect()
}

fn sweep_outstanding(outstanding: &mut Vec<AsyncHpcSubmitter>) -> Result<()> {
    let mut i = 0;
    while i < outstanding.len() {
        if outstanding[i].is_complete()? {
            let unit = outstanding.remove(i);
            tracing::debug!(batch = unit.name(), "batch submission terminal");
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn write_run_script(path: &Path, command: &str, config_path: &Path) -> Result<()> {
    let script = format!("#!/bin/sh\nexec {} {}\n", command, config_path.display());
    fs_err::write(path, script).map_err(convoy_core::errors::CoordinationError::from)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs_err::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(convoy_core::errors::CoordinationError::from)?;
    }
    Ok(())
}
