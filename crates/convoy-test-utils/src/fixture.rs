use convoy_cluster::Cluster;
use convoy_core::model::{JobRecord, SubmissionGroup};
use std::path::PathBuf;

/// A freshly created cluster in a temporary submission directory. The
/// directory lives as long as the fixture.
pub struct ClusterFixture {
    pub _temp_dir: tempfile::TempDir,
    pub path: PathBuf,
}

impl ClusterFixture {
    pub fn create(jobs: Vec<JobRecord>) -> (Self, Cluster) {
        Self::create_with_groups(jobs, vec![SubmissionGroup::default()])
    }

    pub fn create_with_groups(
        jobs: Vec<JobRecord>,
        submission_groups: Vec<SubmissionGroup>,
    ) -> (Self, Cluster) {
        let temp_dir = tempfile::Builder::new()
            .prefix("convoy-test-")
            .tempdir()
            .expect("failed to create temp dir");
        let path = temp_dir.path().to_path_buf();
        let cluster = Cluster::create(&path, jobs, submission_groups)
            .expect("failed to create cluster fixture");
        (
            Self {
                _temp_dir: temp_dir,
                path,
            },
            cluster,
        )
    }
}
