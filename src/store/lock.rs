//! Exclusive lock on a data directory, shared by every process using it.
//!
//! The lock is a `lock` file created with `create_new`; holding the file is
//! holding the lock. It is held only for read-modify-write of the JSON
//! files, never across an oracle call, so a lock older than
//! `STALE_AFTER` belongs to a crashed process and is removed.

use crate::{DistillError, Result};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const LOCK_FILE: &str = "lock";
const RETRY_DELAY: Duration = Duration::from_millis(20);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_AFTER: Duration = Duration::from_secs(30);

/// Removes the lock file when dropped
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    pub async fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        let started = Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let stamp = format!("pid={} time={}\n", std::process::id(), Utc::now().to_rfc3339());
                    let _ = file.write_all(stamp.as_bytes()).await;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path).await {
                        warn!("Removing stale lock {:?}", path);
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    if started.elapsed() >= ACQUIRE_TIMEOUT {
                        return Err(DistillError::Storage(format!(
                            "data directory locked by another process: {:?}",
                            path
                        )));
                    }
                    debug!("Waiting for lock {:?}", path);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn is_stale(path: &Path) -> bool {
    let Ok(modified) = fs::metadata(path).await.and_then(|m| m.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age > STALE_AFTER)
}
