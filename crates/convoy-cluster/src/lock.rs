use convoy_core::errors::{CoordinationError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative advisory lock backed by a file.
///
/// Acquisition creates the file with create-new semantics; release deletes
/// it. This works on NFS and Lustre where kernel `flock` is unreliable,
/// but only excludes participants that honor the same protocol.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Blocks until the lock file can be created, polling every 100 ms.
    /// Fails with `LockTimeout` once `timeout` has elapsed; the caller is
    /// expected to treat that as fatal rather than retry silently.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            match fs_err::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    // Owner breadcrumb for operators debugging a wedged lock.
                    let _ = writeln!(
                        file,
                        "{} pid={}",
                        convoy_core::hostname(),
                        std::process::id()
                    );
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(CoordinationError::LockTimeout {
                            path: path.to_path_buf(),
                            timeout_s: timeout.as_secs(),
                        });
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(CoordinationError::PathIo {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs_err::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to release lock file: {}", e);
        }
    }
}
