use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use rand::prelude::*;
use tracing::{debug, warn};
use crate::LogError;

/// Lock file next to the log. Removed when dropped.
#[derive(Debug)]
pub struct LogLock {
    path:PathBuf,
}

impl LogLock {
    pub fn lock_path(log_file:&Path) -> PathBuf {
        log_file.with_extension("lck")
    }

    /// Wait a random fraction of `max_wait` before each attempt so concurrent checkers
    /// don't keep colliding. Gives up after `attempts` tries.
    pub fn acquire(log_file:&Path,attempts:u32,max_wait:Duration) -> Result<Self,LogError> {
        let path = Self::lock_path(log_file);
        let mut rng = rand::thread_rng();
        for attempt in 0..attempts.max(1) {
            let r:f32 = rng.gen();
            std::thread::sleep(max_wait.mul_f32(r));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!("wrote lock file {:?}",path);
                    return Ok(Self{path})
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(attempt, "found lock file {:?}. trying again later",path);
                }
                Err(e) => return Err(LogError::Io{path,source:e})
            }
        }
        Err(LogError::Locked(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LogLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("cannot remove lock file {:?}: {}",self.path,e);
        }
    }
}

/// true if some other process holds the lock
pub fn is_locked(log_file:&Path) -> bool {
    LogLock::lock_path(log_file).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_waits_then_fails(){
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("completed_preprocessing.tsv");
        let held = LogLock::acquire(&log,1,Duration::ZERO).unwrap();
        assert!(is_locked(&log));
        assert!(matches!(LogLock::acquire(&log,3,Duration::ZERO),Err(LogError::Locked(_))));
        drop(held);
        assert!(!is_locked(&log));
        assert!(LogLock::acquire(&log,1,Duration::ZERO).is_ok());
    }
}
