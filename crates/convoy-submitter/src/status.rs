use crate::error::Result;
use crate::scheduler::{HpcJobStatus, HpcScheduler};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caches the full map of external job statuses and only re-queries the
/// scheduler once `poll_interval` has elapsed since the last query.
///
/// Many `AsyncHpcSubmitter` instances poll independently within the same
/// loop iteration; sharing one collector behind an `Arc<Mutex<..>>`
/// amortizes the expensive cluster-wide query across all of them.
pub struct HpcStatusCollector {
    scheduler: Arc<dyn HpcScheduler>,
    poll_interval: Duration,
    last_query: Option<Instant>,
    statuses: HashMap<String, HpcJobStatus>,
}

impl HpcStatusCollector {
    pub fn new(scheduler: Arc<dyn HpcScheduler>, poll_interval: Duration) -> Self {
        Self {
            scheduler,
            poll_interval,
            last_query: None,
            statuses: HashMap::new(),
        }
    }

    /// Status of one external job, served from the cache when fresh. A
    /// job absent from the scheduler's map reports `None`.
    pub fn status(&mut self, job_id: &str) -> Result<HpcJobStatus> {
        let stale = self
            .last_query
            .map(|t| t.elapsed() > self.poll_interval)
            .unwrap_or(true);
        if stale {
            self.statuses = self.scheduler.check_statuses()?;
            self.last_query = Some(Instant::now());
        }
        Ok(self
            .statuses
            .get(job_id)
            .copied()
            .unwrap_or(HpcJobStatus::None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{SubmitResponse, SubmitStatus};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingScheduler {
        queries: AtomicUsize,
    }

    impl HpcScheduler for CountingScheduler {
        fn submit(&self, _script: &Path) -> crate::error::Result<SubmitResponse> {
            Ok(SubmitResponse {
                status: SubmitStatus::Ok,
                job_id: Some("1".to_string()),
                stderr: String::new(),
            })
        }

        fn check_status(&self, _job_id: &str) -> crate::error::Result<HpcJobStatus> {
            Ok(HpcJobStatus::Running)
        }

        fn check_statuses(&self) -> crate::error::Result<HashMap<String, HpcJobStatus>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok([("1".to_string(), HpcJobStatus::Running)].into())
        }

        fn cancel_job(&self, _job_id: &str) -> crate::error::Result<i32> {
            Ok(0)
        }
    }

    #[test]
    fn test_second_status_call_within_interval_uses_cache() {
        let scheduler = Arc::new(CountingScheduler {
            queries: AtomicUsize::new(0),
        });
        let mut collector =
            HpcStatusCollector::new(Arc::clone(&scheduler) as Arc<dyn HpcScheduler>, Duration::from_secs(60));

        assert_eq!(collector.status("1").unwrap(), HpcJobStatus::Running);
        assert_eq!(collector.status("1").unwrap(), HpcJobStatus::Running);
        assert_eq!(scheduler.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_absent_job_reports_none() {
        let scheduler = Arc::new(CountingScheduler {
            queries: AtomicUsize::new(0),
        });
        let mut collector = HpcStatusCollector::new(scheduler, Duration::from_secs(60));

        assert_eq!(collector.status("gone").unwrap(), HpcJobStatus::None);
    }

    #[test]
    fn test_elapsed_interval_triggers_requery() {
        let scheduler = Arc::new(CountingScheduler {
            queries: AtomicUsize::new(0),
        });
        let mut collector = HpcStatusCollector::new(
            Arc::clone(&scheduler) as Arc<dyn HpcScheduler>,
            Duration::from_millis(0),
        );

        collector.status("1").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        collector.status("1").unwrap();
        assert_eq!(scheduler.queries.load(Ordering::SeqCst), 2);
    }
}
