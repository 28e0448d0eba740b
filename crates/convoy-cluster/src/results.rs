use crate::lock::FileLock;
use chrono::{DateTime, Utc};
use convoy_core::constants::{files, timeouts};
use convoy_core::errors::{CoordinationError, Result};
use convoy_core::model::{JobName, JobResult, ResultStatus};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HEADER: &str = "name,return_code,status,exec_time_s,completion_time,hpc_job_id";

/// Per-process-safe append of completion records to a shared results
/// file. One aggregator instance exists per batch; many workers on the
/// same node append through it concurrently.
#[derive(Debug, Clone)]
pub struct ResultsAggregator {
    path: PathBuf,
}

impl ResultsAggregator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(files::LOCK_SUFFIX);
        self.path.with_file_name(name)
    }

    /// Appends one result row under the file lock, then drops a zero-byte
    /// completion marker named after the job. The marker lets other
    /// processes detect completion with a directory listing instead of
    /// locking and parsing the results file.
    pub fn append_result(&self, result: &JobResult) -> Result<()> {
        let row = format_row(result)?;
        {
            let _lock =
                FileLock::acquire(&self.lock_path(), Duration::from_secs(timeouts::RESULTS_LOCK_S))?;
            let mut file = fs_err::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            if file.metadata()?.len() == 0 {
                writeln!(file, "{}", HEADER)?;
            }
            writeln!(file, "{}", row)?;
        }

        let marker = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&result.name.0);
        fs_err::write(marker, b"")?;
        Ok(())
    }

    pub fn get_results(&self) -> Result<Vec<JobResult>> {
        let _lock =
            FileLock::acquire(&self.lock_path(), Duration::from_secs(timeouts::RESULTS_LOCK_S))?;
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs_err::read_to_string(&self.path)?;
        content
            .lines()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .map(|line| parse_row(&self.path, line))
            .collect()
    }
}

fn format_row(result: &JobResult) -> Result<String> {
    // Rows are plain comma-separated; a delimiter inside a free-form
    // field would corrupt every later read of the file.
    let forbidden: &[char] = &[',', '\n'];
    if result.name.0.contains(forbidden) || result.hpc_job_id.contains(forbidden) {
        return Err(CoordinationError::General(format!(
            "result fields must not contain commas or newlines: name '{}', hpc_job_id '{}'",
            result.name, result.hpc_job_id
        )));
    }
    Ok(format!(
        "{},{},{},{},{},{}",
        result.name,
        result.return_code,
        result.status,
        result.exec_time_s,
        result.completion_time.to_rfc3339(),
        result.hpc_job_id
    ))
}

fn parse_row(path: &Path, line: &str) -> Result<JobResult> {
    let malformed = || CoordinationError::MalformedResultRow {
        path: path.to_path_buf(),
        line: line.to_string(),
    };

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 6 {
        return Err(malformed());
    }
    let return_code: i32 = fields[1].parse().map_err(|_| malformed())?;
    let status: ResultStatus = fields[2].parse().map_err(|_| malformed())?;
    let exec_time_s: f64 = fields[3].parse().map_err(|_| malformed())?;
    let completion_time = DateTime::parse_from_rfc3339(fields[4])
        .map_err(|_| malformed())?
        .with_timezone(&Utc);

    Ok(JobResult {
        name: JobName::from(fields[0]),
        return_code,
        status,
        exec_time_s,
        completion_time,
        hpc_job_id: fields[5].to_string(),
    })
}

/// Consolidates every aggregator file under a results directory and
/// consumes completion markers. The aggregator list is rebuilt on each
/// call because new batches create new files.
#[derive(Debug)]
pub struct ResultsAggregatorSummary {
    path: PathBuf,
    completed_jobs: BTreeSet<JobName>,
}

impl ResultsAggregatorSummary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            completed_jobs: BTreeSet::new(),
        }
    }

    pub fn completed_jobs(&self) -> &BTreeSet<JobName> {
        &self.completed_jobs
    }

    /// Union of the parsed results of every aggregator CSV currently in
    /// the directory.
    pub fn get_results(&self) -> Result<Vec<JobResult>> {
        let mut results = Vec::new();
        for entry in fs_err::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(files::RESULTS_SUFFIX) {
                results.extend(ResultsAggregator::new(entry.path()).get_results()?);
            }
        }
        Ok(results)
    }

    /// Folds newly observed completion markers into the accumulated
    /// completed set and deletes each marker, so every completion signal
    /// is consumed at most once per polling node.
    pub fn update_completed_jobs(&mut self) -> Result<&BTreeSet<JobName>> {
        for entry in fs_err::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // The directory holds aggregator CSVs and their lock files
            // next to the markers; only bare names are markers.
            if name.ends_with(files::RESULTS_SUFFIX) || name.ends_with(files::LOCK_SUFFIX) {
                continue;
            }
            self.completed_jobs.insert(JobName(name));
            fs_err::remove_file(entry.path())?;
        }
        Ok(&self.completed_jobs)
    }
}
