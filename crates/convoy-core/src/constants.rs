pub mod files {
    pub const CLUSTER_CONFIG: &str = "cluster_config.json";
    pub const CONFIG_VERSION: &str = "config_version.txt";
    pub const JOB_STATUS: &str = "job_status.json";
    pub const JOB_STATUS_VERSION: &str = "job_status_version.txt";
    pub const CLUSTER_LOCK: &str = "cluster_config.json.lock";
    pub const SESSION_LOG: &str = "submitter.log";

    pub const RESULTS_SUFFIX: &str = ".csv";
    pub const LOCK_SUFFIX: &str = ".lock";

    pub fn batch_config_name(batch_index: usize) -> String {
        format!("config_batch_{}.json", batch_index)
    }

    pub fn run_script_name(batch_index: usize) -> String {
        format!("run_batch_{}.sh", batch_index)
    }

    pub fn results_file_name(batch_index: usize) -> String {
        format!("results_batch_{}{}", batch_index, RESULTS_SUFFIX)
    }
}

pub mod dirs {
    pub const RESULTS: &str = "results";
}

pub mod timeouts {
    /// Cluster state lock acquisition bound, seconds.
    pub const CLUSTER_LOCK_S: u64 = 60;
    /// Results file lock acquisition bound, seconds.
    pub const RESULTS_LOCK_S: u64 = 30;
}
