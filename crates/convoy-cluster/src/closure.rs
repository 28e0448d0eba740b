use convoy_core::model::{JobName, JobRecord};
use std::collections::{BTreeMap, BTreeSet};

/// Computes the transitive set of jobs that must be resubmitted given a
/// seed set of failed or missing jobs.
///
/// Any job whose blocking set intersects the expanded set joins it, with
/// the intersecting subset recorded as its blocking set for after
/// resubmission. Seeds start with empty blocking sets and may regain
/// blockers if those blockers are themselves in the set.
///
/// Convergence within `jobs.len()` passes is an internal-consistency
/// requirement; failing it means the graph or the accounting is corrupt
/// and aborts the process. Cycles in the original graph are not detected
/// here: a cycle either converges (when a member is seeded) or is never
/// reached.
pub fn dependency_closure(
    seed: &BTreeSet<JobName>,
    jobs: &[JobRecord],
) -> BTreeMap<JobName, BTreeSet<JobName>> {
    let mut expanded: BTreeMap<JobName, BTreeSet<JobName>> = seed
        .iter()
        .map(|name| (name.clone(), BTreeSet::new()))
        .collect();

    let max_passes = jobs.len();
    for _ in 0..=max_passes {
        let mut changed = false;
        for job in jobs {
            let intersect: BTreeSet<JobName> = job
                .blocked_by
                .iter()
                .filter(|blocker| expanded.contains_key(blocker))
                .cloned()
                .collect();
            if intersect.is_empty() {
                continue;
            }
            match expanded.get(&job.name) {
                Some(current) if *current == intersect => {}
                _ => {
                    expanded.insert(job.name.clone(), intersect);
                    changed = true;
                }
            }
        }
        if !changed {
            return expanded;
        }
    }

    panic!(
        "dependency closure did not converge within {} passes; the job graph or its accounting is corrupt",
        max_passes
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Vec<JobRecord> {
        vec![
            JobRecord::new("a"),
            JobRecord::with_blocking_jobs("b", ["a"]),
            JobRecord::with_blocking_jobs("c", ["b"]),
            JobRecord::new("d"),
        ]
    }

    #[test]
    fn test_chain_expands_transitively() {
        let seed: BTreeSet<JobName> = [JobName::from("a")].into();
        let expanded = dependency_closure(&seed, &chain());

        assert_eq!(expanded.len(), 3);
        assert_eq!(expanded[&JobName::from("a")], BTreeSet::new());
        assert_eq!(expanded[&JobName::from("b")], [JobName::from("a")].into());
        assert_eq!(expanded[&JobName::from("c")], [JobName::from("b")].into());
        assert!(
            !expanded.contains_key(&JobName::from("d")),
            "unrelated jobs stay out of the closure"
        );
    }

    #[test]
    fn test_seed_regains_blockers_inside_set() {
        // Both b and its blocker a failed; b's recorded blocking set must
        // include a so resubmission serializes them again.
        let seed: BTreeSet<JobName> = [JobName::from("a"), JobName::from("b")].into();
        let expanded = dependency_closure(&seed, &chain());

        assert_eq!(expanded[&JobName::from("b")], [JobName::from("a")].into());
    }

    #[test]
    fn test_only_intersecting_subset_recorded() {
        let jobs = vec![
            JobRecord::new("a"),
            JobRecord::new("x"),
            JobRecord::with_blocking_jobs("b", ["a", "x"]),
        ];
        let seed: BTreeSet<JobName> = [JobName::from("a")].into();
        let expanded = dependency_closure(&seed, &jobs);

        // x completed successfully; only the failed blocker is re-recorded.
        assert_eq!(expanded[&JobName::from("b")], [JobName::from("a")].into());
    }

    #[test]
    fn test_empty_seed_is_empty_closure() {
        let expanded = dependency_closure(&BTreeSet::new(), &chain());
        assert!(expanded.is_empty());
    }

    #[test]
    fn test_cycle_with_seeded_member_converges() {
        let jobs = vec![
            JobRecord::with_blocking_jobs("a", ["b"]),
            JobRecord::with_blocking_jobs("b", ["a"]),
        ];
        let seed: BTreeSet<JobName> = [JobName::from("a")].into();
        let expanded = dependency_closure(&seed, &jobs);

        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[&JobName::from("a")], [JobName::from("b")].into());
        assert_eq!(expanded[&JobName::from("b")], [JobName::from("a")].into());
    }
}
