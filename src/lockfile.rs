//! Inter-process advisory locks over sibling `.lock` files.
//!
//! Every piece of persisted state (wallet pools, challenge cache, failed
//! solutions) is guarded by one of these in addition to an in-process mutex.
//! The in-process lock must be taken first, then the file lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tokio::time::{sleep, Instant};

use crate::error::MinerError;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Held exclusive lock; released on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Acquire an exclusive advisory lock on `path`, creating the lock file if
/// needed. Gives up with `MinerError::LockTimeout` after `timeout`.
pub async fn acquire(path: &Path, timeout: Duration) -> Result<FileLockGuard, MinerError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;

    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                return Ok(FileLockGuard {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(_) if Instant::now() < deadline => sleep(RETRY_INTERVAL).await,
            Err(_) => return Err(MinerError::LockTimeout(path.display().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json.lock");

        let guard = acquire(&path, Duration::from_secs(1)).await.unwrap();
        drop(guard);

        acquire(&path, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn second_handle_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json.lock");

        let _guard = acquire(&path, Duration::from_secs(1)).await.unwrap();

        // A second open file handle cannot take the lock while it is held.
        let err = acquire(&path, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, MinerError::LockTimeout(_)));
    }
}
