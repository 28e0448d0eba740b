use crate::lock::FileLock;
use convoy_core::constants::{dirs, files, timeouts};
use convoy_core::errors::{CoordinationError, Result};
use convoy_core::model::{
    ClusterState, JobName, JobRecord, JobState, JobStatusState, SubmissionGroup,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Disjoint sets folded into the job table by one scheduling cycle.
#[derive(Debug, Default, Clone)]
pub struct JobStatusUpdate {
    /// Jobs entering SUBMITTED. Must currently be NOT_SUBMITTED.
    pub submitted: Vec<JobName>,
    /// Jobs that became newly blocked, carrying their updated blocking sets.
    /// Must currently be NOT_SUBMITTED.
    pub blocked: Vec<JobRecord>,
    /// Jobs canceled before ever running (blocking job failed). Terminal.
    pub canceled: Vec<JobName>,
    /// Jobs whose completion markers were observed. Terminal.
    pub completed: Vec<JobName>,
    /// The currently outstanding external scheduler job IDs.
    pub hpc_job_ids: Vec<String>,
    /// The next batch sequence number.
    pub next_batch_index: usize,
}

/// Distributed, lock-guarded, versioned persistence of cluster-wide and
/// per-job state. Every node sees the same files under the submission
/// path; whichever node currently holds the submitter role drives
/// mutations through this type.
#[derive(Debug)]
pub struct Cluster {
    path: PathBuf,
    hostname: String,
    state: ClusterState,
    job_status: Option<JobStatusState>,
}

impl Cluster {
    /// Initializes both state files at version 0 and unconditionally takes
    /// the submitter role.
    pub fn create(
        path: &Path,
        jobs: Vec<JobRecord>,
        submission_groups: Vec<SubmissionGroup>,
    ) -> Result<Cluster> {
        fs_err::create_dir_all(path)?;
        fs_err::create_dir_all(path.join(dirs::RESULTS))?;

        let hostname = convoy_core::hostname();
        let state = ClusterState {
            submitter: hostname.clone(),
            path: path.to_path_buf(),
            num_jobs: jobs.len(),
            submitted_jobs: 0,
            completed_jobs: 0,
            is_complete: false,
            is_canceled: false,
            version: 0,
            submission_groups,
        };
        let job_status = JobStatusState {
            jobs,
            hpc_job_ids: Vec::new(),
            batch_index: 0,
            version: 0,
        };

        write_version_file(&path.join(files::CONFIG_VERSION), 0)?;
        write_json(&path.join(files::CLUSTER_CONFIG), &state)?;
        write_version_file(&path.join(files::JOB_STATUS_VERSION), 0)?;
        write_json(&path.join(files::JOB_STATUS), &job_status)?;

        tracing::info!(
            path = %path.display(),
            num_jobs = state.num_jobs,
            host = %hostname,
            "created cluster"
        );

        Ok(Cluster {
            path: path.to_path_buf(),
            hostname,
            state,
            job_status: Some(job_status),
        })
    }

    /// Loads an existing cluster. With `try_promote`, attempts to take the
    /// submitter role; the returned flag reports whether promotion
    /// happened. Promotion is never attempted on a completed cluster and
    /// never changes an already-set submitter.
    pub fn deserialize(path: &Path, try_promote: bool, load_jobs: bool) -> Result<(Cluster, bool)> {
        let config_path = path.join(files::CLUSTER_CONFIG);
        if !config_path.exists() {
            return Err(CoordinationError::ClusterNotFound(path.to_path_buf()));
        }

        let state: ClusterState = read_json(&config_path)?;
        let job_status = if load_jobs {
            Some(read_json(&path.join(files::JOB_STATUS))?)
        } else {
            None
        };

        let mut cluster = Cluster {
            path: path.to_path_buf(),
            hostname: convoy_core::hostname(),
            state,
            job_status,
        };

        let promoted = if try_promote && !cluster.state.is_complete {
            cluster.promote_to_submitter()?
        } else {
            false
        };

        Ok((cluster, promoted))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn job_status(&self) -> Option<&JobStatusState> {
        self.job_status.as_ref()
    }

    pub fn is_submitter(&self) -> bool {
        self.state.submitter == self.hostname
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete
    }

    /// Jobs that have not yet been placed into any batch.
    pub fn remaining_jobs(&self) -> Vec<JobRecord> {
        self.job_status
            .as_ref()
            .map(|status| {
                status
                    .jobs
                    .iter()
                    .filter(|j| j.state == JobState::NotSubmitted)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Takes the submitter role if no other node holds it. Returns false
    /// (a no-op, not an error) when a submitter is already set.
    pub fn promote_to_submitter(&mut self) -> Result<bool> {
        self.do_under_lock(|cluster| {
            cluster.reload_state()?;
            if cluster.state.has_submitter() {
                return Ok(false);
            }
            cluster.state.submitter = cluster.hostname.clone();
            cluster.write_state()?;
            tracing::info!(host = %cluster.hostname, "promoted to submitter");
            Ok(true)
        })
    }

    /// Releases the submitter role. A no-op when another node (or nobody)
    /// holds it.
    pub fn demote_from_submitter(&mut self) -> Result<()> {
        self.do_under_lock(|cluster| {
            cluster.reload_state()?;
            if cluster.state.submitter != cluster.hostname {
                return Ok(());
            }
            cluster.state.submitter = String::new();
            cluster.write_state()?;
            tracing::info!(host = %cluster.hostname, "demoted from submitter");
            Ok(())
        })
    }

    /// Marks the run finished. Verifies the completed-count invariant
    /// against the job table and clears the submitter role; a completed
    /// cluster has no leader.
    pub fn mark_complete(&mut self, canceled: bool) -> Result<()> {
        self.do_under_lock(|cluster| {
            cluster.reload_state()?;
            cluster.reload_job_status()?;

            if !canceled {
                let done = cluster
                    .job_status
                    .as_ref()
                    .map(JobStatusState::done_count)
                    .unwrap_or(0);
                assert_eq!(
                    done, cluster.state.completed_jobs,
                    "completed_jobs={} disagrees with job table DONE count={}; state is corrupt",
                    cluster.state.completed_jobs, done
                );
            }

            cluster.state.is_complete = true;
            cluster.state.is_canceled = canceled;
            cluster.state.submitter = String::new();
            cluster.write_state()?;
            tracing::info!(
                completed_jobs = cluster.state.completed_jobs,
                canceled,
                "cluster marked complete"
            );
            Ok(())
        })
    }

    /// Folds one scheduling cycle's transitions into the job table and the
    /// cluster counters. Counts are re-derived from the table rather than
    /// incremented so that a crash between the two state writes self-heals
    /// on the next fold.
    pub fn update_job_status(&mut self, update: &JobStatusUpdate) -> Result<()> {
        self.do_under_lock(|cluster| {
            cluster.reload_state()?;
            cluster.reload_job_status()?;

            let status = cluster
                .job_status
                .as_mut()
                .expect("job status loaded above");

            for name in &update.submitted {
                let job = find_job_mut(status, name);
                assert_eq!(
                    job.state,
                    JobState::NotSubmitted,
                    "job '{}' cannot transition to SUBMITTED from {}",
                    name,
                    job.state
                );
                job.state = JobState::Submitted;
            }

            for blocked in &update.blocked {
                let job = find_job_mut(status, &blocked.name);
                assert_eq!(
                    job.state,
                    JobState::NotSubmitted,
                    "job '{}' cannot become blocked from {}",
                    blocked.name,
                    job.state
                );
                job.blocked_by = blocked.blocked_by.clone();
            }

            for name in update.canceled.iter().chain(&update.completed) {
                let job = find_job_mut(status, name);
                assert_ne!(
                    job.state,
                    JobState::Done,
                    "job '{}' completed twice; completion accounting is corrupt",
                    name
                );
                job.state = JobState::Done;
            }

            // Dependencies only matter pre-submission.
            for job in &mut status.jobs {
                if job.state != JobState::NotSubmitted {
                    job.blocked_by.clear();
                }
            }

            status.hpc_job_ids = update.hpc_job_ids.clone();
            status.batch_index = update.next_batch_index;

            cluster.state.submitted_jobs = status
                .jobs
                .iter()
                .filter(|j| j.state != JobState::NotSubmitted)
                .count();
            cluster.state.completed_jobs = status.done_count();
            assert!(
                cluster.state.completed_jobs <= cluster.state.num_jobs,
                "completed_jobs={} exceeds num_jobs={}",
                cluster.state.completed_jobs,
                cluster.state.num_jobs
            );

            cluster.write_state()?;
            cluster.write_job_status()?;
            Ok(())
        })
    }

    /// Resets a set of jobs for another pass. Requires no lock: this is
    /// only called when the run is already complete and no other node is
    /// active. Already-DONE jobs outside the set are untouched.
    pub fn prepare_for_resubmission(
        &mut self,
        job_names: &BTreeSet<JobName>,
        updated_blocking_jobs: &BTreeMap<JobName, BTreeSet<JobName>>,
    ) -> Result<()> {
        self.reload_state()?;
        self.reload_job_status()?;

        let status = self.job_status.as_mut().expect("job status loaded above");
        for name in job_names {
            let job = find_job_mut(status, name);
            job.state = JobState::NotSubmitted;
            job.blocked_by = updated_blocking_jobs.get(name).cloned().unwrap_or_default();
        }

        self.state.is_complete = false;
        self.state.is_canceled = false;
        self.state.submitted_jobs = self.state.num_jobs - job_names.len();
        self.state.completed_jobs = self
            .job_status
            .as_ref()
            .map(JobStatusState::done_count)
            .unwrap_or(0);

        self.write_state()?;
        self.write_job_status()?;
        tracing::info!(
            resubmitted = job_names.len(),
            completed_jobs = self.state.completed_jobs,
            "prepared cluster for resubmission"
        );
        Ok(())
    }

    /// Runs `f` while holding the cluster lock. If `f` fails, the lock's
    /// backing file is recreated empty before the error propagates: the
    /// release already deleted it, and waiting nodes must not block on a
    /// lock that no longer exists while the cluster state is unknown. The
    /// caller treats such an error as fatal to its submitter role.
    fn do_under_lock<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let lock_path = self.path.join(files::CLUSTER_LOCK);
        let lock = FileLock::acquire(&lock_path, Duration::from_secs(timeouts::CLUSTER_LOCK_S))?;
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                drop(lock);
                if let Err(create_err) = fs_err::write(&lock_path, b"") {
                    tracing::error!(
                        path = %lock_path.display(),
                        "failed to recreate lock file after error: {}",
                        create_err
                    );
                }
                Err(e)
            }
        }
    }

    fn reload_state(&mut self) -> Result<()> {
        self.state = read_json(&self.path.join(files::CLUSTER_CONFIG))?;
        Ok(())
    }

    fn reload_job_status(&mut self) -> Result<()> {
        self.job_status = Some(read_json(&self.path.join(files::JOB_STATUS))?);
        Ok(())
    }

    /// Version-check-then-write for the cluster config. The side-file must
    /// still equal the version this process last observed; the new version
    /// is written first, then the full state file.
    fn write_state(&mut self) -> Result<()> {
        let version_path = self.path.join(files::CONFIG_VERSION);
        let on_disk = read_version_file(&version_path)?;
        if on_disk != self.state.version {
            return Err(CoordinationError::ClusterConfigVersionMismatch {
                expected: self.state.version,
                actual: on_disk,
            });
        }
        self.state.version += 1;
        write_version_file(&version_path, self.state.version)?;
        write_json(&self.path.join(files::CLUSTER_CONFIG), &self.state)?;
        Ok(())
    }

    fn write_job_status(&mut self) -> Result<()> {
        let status = self
            .job_status
            .as_mut()
            .expect("job status must be loaded before writing");
        let version_path = self.path.join(files::JOB_STATUS_VERSION);
        let on_disk = read_version_file(&version_path)?;
        if on_disk != status.version {
            return Err(CoordinationError::JobStatusVersionMismatch {
                expected: status.version,
                actual: on_disk,
            });
        }
        status.version += 1;
        write_version_file(&version_path, status.version)?;
        write_json(&self.path.join(files::JOB_STATUS), status)?;
        Ok(())
    }
}

fn find_job_mut<'a>(status: &'a mut JobStatusState, name: &JobName) -> &'a mut JobRecord {
    status
        .find_job_mut(name)
        .unwrap_or_else(|| panic!("job '{}' is not in the job table", name))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs_err::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs_err::write(path, json)?;
    Ok(())
}

fn read_version_file(path: &Path) -> Result<u64> {
    let content = fs_err::read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|_| CoordinationError::General(format!("malformed version file '{}'", path.display())))
}

fn write_version_file(path: &Path, version: u64) -> Result<()> {
    fs_err::write(path, format!("{}\n", version))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn three_jobs() -> Vec<JobRecord> {
        vec![
            JobRecord::new("a"),
            JobRecord::new("b"),
            JobRecord::with_blocking_jobs("c", ["b"]),
        ]
    }

    #[test]
    fn test_create_writes_all_state_files() {
        let dir = tempdir().unwrap();
        let cluster = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        assert!(dir.path().join(files::CLUSTER_CONFIG).exists());
        assert!(dir.path().join(files::CONFIG_VERSION).exists());
        assert!(dir.path().join(files::JOB_STATUS).exists());
        assert!(dir.path().join(files::JOB_STATUS_VERSION).exists());
        assert!(cluster.is_submitter());
        assert_eq!(cluster.state().num_jobs, 3);
        assert_eq!(cluster.state().version, 0);
    }

    #[test]
    fn test_deserialize_does_not_repromote() {
        let dir = tempdir().unwrap();
        let _creator = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        // The creator is the submitter; a second load must not take over.
        let (cluster, promoted) = Cluster::deserialize(dir.path(), true, false).unwrap();
        assert!(!promoted);
        assert!(cluster.state().has_submitter());
    }

    #[test]
    fn test_promote_after_demote() {
        let dir = tempdir().unwrap();
        let _creator = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        let (mut cluster, _) = Cluster::deserialize(dir.path(), false, false).unwrap();
        cluster.demote_from_submitter().unwrap();
        assert!(!cluster.state().has_submitter());

        let (cluster, promoted) = Cluster::deserialize(dir.path(), true, false).unwrap();
        assert!(promoted);
        assert!(cluster.is_submitter());
    }

    #[test]
    fn test_update_job_status_fold() {
        let dir = tempdir().unwrap();
        let mut cluster = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        cluster
            .update_job_status(&JobStatusUpdate {
                submitted: vec![JobName::from("a"), JobName::from("b")],
                blocked: vec![JobRecord::with_blocking_jobs("c", ["b"])],
                hpc_job_ids: vec!["100".to_string()],
                next_batch_index: 1,
                ..Default::default()
            })
            .unwrap();

        let status = cluster.job_status().unwrap();
        assert_eq!(
            status.find_job(&JobName::from("a")).unwrap().state,
            JobState::Submitted
        );
        assert_eq!(cluster.state().submitted_jobs, 2);
        assert_eq!(cluster.state().completed_jobs, 0);
        assert_eq!(status.batch_index, 1);

        cluster
            .update_job_status(&JobStatusUpdate {
                completed: vec![JobName::from("a"), JobName::from("b")],
                hpc_job_ids: vec![],
                next_batch_index: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cluster.state().completed_jobs, 2);
        // b is DONE, so c's blocking set is irrelevant only once c submits;
        // c itself is still NOT_SUBMITTED and keeps its recorded blockers.
        assert_eq!(cluster.remaining_jobs().len(), 1);
    }

    #[test]
    fn test_submitted_jobs_clear_blocking_sets() {
        let dir = tempdir().unwrap();
        let mut cluster = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        cluster
            .update_job_status(&JobStatusUpdate {
                submitted: vec![JobName::from("b"), JobName::from("c")],
                next_batch_index: 1,
                ..Default::default()
            })
            .unwrap();
        let c = cluster
            .job_status()
            .unwrap()
            .find_job(&JobName::from("c"))
            .unwrap();
        assert_eq!(c.state, JobState::Submitted);
        assert!(c.blocked_by.is_empty());
    }

    #[test]
    #[should_panic(expected = "cannot transition to SUBMITTED")]
    fn test_double_submit_is_fatal() {
        let dir = tempdir().unwrap();
        let mut cluster = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        let update = JobStatusUpdate {
            submitted: vec![JobName::from("a")],
            next_batch_index: 1,
            ..Default::default()
        };
        cluster.update_job_status(&update).unwrap();
        cluster.update_job_status(&update).unwrap();
    }

    #[test]
    fn test_stale_version_write_is_rejected() {
        let dir = tempdir().unwrap();
        let mut cluster = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        let config_before = fs_err::read_to_string(dir.path().join(files::CLUSTER_CONFIG)).unwrap();

        // Simulate a crash that bumped the side-file past the state file.
        fs_err::write(dir.path().join(files::CONFIG_VERSION), "7\n").unwrap();

        let err = cluster.demote_from_submitter().unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::ClusterConfigVersionMismatch {
                expected: 0,
                actual: 7
            }
        ));

        let config_after = fs_err::read_to_string(dir.path().join(files::CLUSTER_CONFIG)).unwrap();
        assert_eq!(config_before, config_after, "state file must not change");
    }

    #[test]
    fn test_stale_job_status_version_write_is_rejected() {
        let dir = tempdir().unwrap();
        let mut cluster = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        let status_before = fs_err::read_to_string(dir.path().join(files::JOB_STATUS)).unwrap();

        fs_err::write(dir.path().join(files::JOB_STATUS_VERSION), "9\n").unwrap();

        let err = cluster
            .update_job_status(&JobStatusUpdate {
                submitted: vec![JobName::from("a")],
                next_batch_index: 1,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::JobStatusVersionMismatch {
                expected: 0,
                actual: 9
            }
        ));

        let status_after = fs_err::read_to_string(dir.path().join(files::JOB_STATUS)).unwrap();
        assert_eq!(status_before, status_after, "job status file must not change");
    }

    #[test]
    fn test_lock_file_recreated_after_error_under_lock() {
        let dir = tempdir().unwrap();
        let mut cluster = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        fs_err::write(dir.path().join(files::CONFIG_VERSION), "7\n").unwrap();
        assert!(cluster.demote_from_submitter().is_err());

        // The failed operation must leave a lock file behind so waiting
        // nodes observe a held lock instead of spinning on a missing one.
        assert!(dir.path().join(files::CLUSTER_LOCK).exists());
    }

    #[test]
    fn test_mark_complete_clears_submitter() {
        let dir = tempdir().unwrap();
        let mut cluster = Cluster::create(dir.path(), vec![JobRecord::new("a")], vec![]).unwrap();

        cluster
            .update_job_status(&JobStatusUpdate {
                submitted: vec![JobName::from("a")],
                next_batch_index: 1,
                ..Default::default()
            })
            .unwrap();
        cluster
            .update_job_status(&JobStatusUpdate {
                completed: vec![JobName::from("a")],
                next_batch_index: 1,
                ..Default::default()
            })
            .unwrap();
        cluster.mark_complete(false).unwrap();

        assert!(cluster.is_complete());
        assert!(!cluster.state().has_submitter());

        let (_, promoted) = Cluster::deserialize(dir.path(), true, false).unwrap();
        assert!(!promoted, "no promotion on a complete cluster");
    }

    #[test]
    fn test_prepare_for_resubmission() {
        let dir = tempdir().unwrap();
        let mut cluster = Cluster::create(dir.path(), three_jobs(), vec![]).unwrap();

        cluster
            .update_job_status(&JobStatusUpdate {
                submitted: vec![JobName::from("a"), JobName::from("b"), JobName::from("c")],
                next_batch_index: 1,
                ..Default::default()
            })
            .unwrap();
        cluster
            .update_job_status(&JobStatusUpdate {
                completed: vec![JobName::from("a"), JobName::from("b"), JobName::from("c")],
                next_batch_index: 1,
                ..Default::default()
            })
            .unwrap();
        cluster.mark_complete(false).unwrap();

        let names: BTreeSet<JobName> = [JobName::from("b"), JobName::from("c")].into();
        let blocking: BTreeMap<JobName, BTreeSet<JobName>> =
            [(JobName::from("c"), [JobName::from("b")].into())].into();
        cluster.prepare_for_resubmission(&names, &blocking).unwrap();

        assert!(!cluster.is_complete());
        assert_eq!(cluster.state().submitted_jobs, 1);
        assert_eq!(cluster.state().completed_jobs, 1);

        let status = cluster.job_status().unwrap();
        assert_eq!(
            status.find_job(&JobName::from("a")).unwrap().state,
            JobState::Done
        );
        let c = status.find_job(&JobName::from("c")).unwrap();
        assert_eq!(c.state, JobState::NotSubmitted);
        assert_eq!(c.blocked_by, [JobName::from("b")].into());
    }
}
