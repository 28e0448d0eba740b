use crate::error::Result;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

/// A unit the queue can run. Implementations wrap a local job process or
/// an outstanding HPC batch submission.
pub trait Runnable {
    fn name(&self) -> &str;

    /// Starts the unit. Called exactly once, in submission order.
    fn run(&mut self) -> Result<()>;

    /// Polled after `run`; the unit leaves the outstanding set on true.
    fn is_complete(&mut self) -> Result<bool>;

    /// Names of units that must complete before this one may start.
    fn blocking_jobs(&self) -> &BTreeSet<String>;

    fn remove_blocking_job(&mut self, name: &str);
}

/// Bounded-concurrency executor for an ordered list of runnable units on
/// one node.
///
/// Units start in submission order; a unit waits until the outstanding
/// count is below the depth limit and its blocking set is empty. The
/// queue does not understand dependency ordering beyond that: the caller
/// guarantees that every blocker of a queued unit either already
/// completed or appears earlier in the same list.
pub struct JobQueue {
    max_queue_depth: usize,
    poll_interval: Duration,
}

impl JobQueue {
    pub fn new(max_queue_depth: usize, poll_interval: Duration) -> Self {
        Self {
            max_queue_depth: max_queue_depth.max(1),
            poll_interval,
        }
    }

    /// Default depth for local execution: one unit per CPU.
    pub fn default_depth() -> usize {
        num_cpus::get()
    }

    pub fn run_jobs(&self, units: Vec<Box<dyn Runnable>>) -> Result<()> {
        let total = units.len();
        let mut waiting: VecDeque<Box<dyn Runnable>> = units.into();
        let mut outstanding: Vec<Box<dyn Runnable>> = Vec::new();
        let mut completed_count = 0usize;

        while let Some(mut unit) = waiting.pop_front() {
            loop {
                let finished = sweep_completed(&mut outstanding)?;
                completed_count += finished.len();
                for name in &finished {
                    unit.remove_blocking_job(name);
                    for other in waiting.iter_mut() {
                        other.remove_blocking_job(name);
                    }
                }

                if outstanding.len() < self.max_queue_depth && unit.blocking_jobs().is_empty() {
                    break;
                }
                thread::sleep(self.poll_interval);
            }

            tracing::debug!(name = unit.name(), "starting unit");
            unit.run()?;
            outstanding.push(unit);
        }

        while !outstanding.is_empty() {
            let finished = sweep_completed(&mut outstanding)?;
            completed_count += finished.len();
            if outstanding.is_empty() {
                break;
            }
            thread::sleep(self.poll_interval);
        }

        assert_eq!(
            completed_count, total,
            "queue started {} units but saw {} complete",
            total, completed_count
        );
        Ok(())
    }
}

fn sweep_completed(outstanding: &mut Vec<Box<dyn Runnable>>) -> Result<Vec<String>> {
    let mut finished = Vec::new();
    let mut i = 0;
    while i < outstanding.len() {
        if outstanding[i].is_complete()? {
            let unit = outstanding.remove(i);
            tracing::debug!(name = unit.name(), "unit complete");
            finished.push(unit.name().to_string());
        } else {
            i += 1;
        }
    }
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Trace {
        events: Vec<String>,
        running: usize,
        max_running: usize,
    }

    /// Completes a fixed number of polls after starting.
    struct FakeUnit {
        name: String,
        blocking: BTreeSet<String>,
        polls_until_done: usize,
        started: bool,
        trace: Arc<Mutex<Trace>>,
    }

    impl FakeUnit {
        fn new(name: &str, blocking: &[&str], trace: &Arc<Mutex<Trace>>) -> Box<dyn Runnable> {
            Box::new(Self {
                name: name.to_string(),
                blocking: blocking.iter().map(|s| s.to_string()).collect(),
                polls_until_done: 2,
                started: false,
                trace: Arc::clone(trace),
            })
        }
    }

    impl Runnable for FakeUnit {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&mut self) -> Result<()> {
            self.started = true;
            let mut trace = self.trace.lock().unwrap();
            trace.events.push(format!("start {}", self.name));
            trace.running += 1;
            trace.max_running = trace.max_running.max(trace.running);
            Ok(())
        }

        fn is_complete(&mut self) -> Result<bool> {
            if !self.started {
                return Ok(false);
            }
            if self.polls_until_done > 0 {
                self.polls_until_done -= 1;
                return Ok(false);
            }
            let mut trace = self.trace.lock().unwrap();
            trace.events.push(format!("done {}", self.name));
            trace.running -= 1;
            Ok(true)
        }

        fn blocking_jobs(&self) -> &BTreeSet<String> {
            &self.blocking
        }

        fn remove_blocking_job(&mut self, name: &str) {
            self.blocking.remove(name);
        }
    }

    fn queue() -> JobQueue {
        JobQueue::new(2, Duration::from_millis(1))
    }

    #[test]
    fn test_all_units_run_and_complete() {
        let trace = Arc::new(Mutex::new(Trace::default()));
        let units = vec![
            FakeUnit::new("a", &[], &trace),
            FakeUnit::new("b", &[], &trace),
            FakeUnit::new("c", &[], &trace),
        ];
        queue().run_jobs(units).unwrap();

        let trace = trace.lock().unwrap();
        assert_eq!(trace.running, 0);
        assert_eq!(
            trace.events.iter().filter(|e| e.starts_with("done")).count(),
            3
        );
    }

    #[test]
    fn test_depth_limit_is_respected() {
        let trace = Arc::new(Mutex::new(Trace::default()));
        let units: Vec<_> = (0..6)
            .map(|i| FakeUnit::new(&format!("u{}", i), &[], &trace))
            .collect();
        queue().run_jobs(units).unwrap();

        assert!(trace.lock().unwrap().max_running <= 2);
    }

    #[test]
    fn test_blocked_unit_starts_after_blocker_completes() {
        let trace = Arc::new(Mutex::new(Trace::default()));
        let units = vec![
            FakeUnit::new("first", &[], &trace),
            FakeUnit::new("second", &["first"], &trace),
        ];
        queue().run_jobs(units).unwrap();

        let events = trace.lock().unwrap().events.clone();
        let done_first = events.iter().position(|e| e == "done first").unwrap();
        let start_second = events.iter().position(|e| e == "start second").unwrap();
        assert!(
            done_first < start_second,
            "blocked unit must wait for its blocker: {:?}",
            events
        );
    }

    #[test]
    fn test_empty_list_is_a_noop() {
        queue().run_jobs(Vec::new()).unwrap();
    }

    #[test]
    fn test_default_depth_is_at_least_one() {
        assert!(JobQueue::default_depth() >= 1);
    }
}
