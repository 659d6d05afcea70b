//! Advisory lock guarding a target root.
//!
//! The lock is a file created with `create_new` under the state directory.
//! Its JSON body identifies the owner, so a lock left behind by a dead
//! process, or one older than the configured threshold, can be cleared.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, LockHeldError};
use crate::fs_utils::{mtime_unix, remove_file_if_exists};
use crate::transactions::{current_unix_timestamp, process_alive};
use crate::TargetLayout;

const LOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub version: u32,
    pub pid: u32,
    pub txid: String,
    pub operation: String,
    pub acquired_at_unix: u64,
}

#[derive(Debug)]
pub struct TargetLock {
    path: PathBuf,
    txid: String,
    released: bool,
}

impl TargetLock {
    pub fn acquire(
        layout: &TargetLayout,
        txid: &str,
        operation: &str,
        stale_after: Duration,
    ) -> Result<Self, EngineError> {
        let path = layout.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let metadata = LockMetadata {
            version: LOCK_VERSION,
            pid: std::process::id(),
            txid: txid.to_string(),
            operation: operation.to_string(),
            acquired_at_unix: current_unix_timestamp()?,
        };
        let raw =
            serde_json::to_vec_pretty(&metadata).context("failed to serialize lock metadata")?;

        // second attempt only after a stale lock was cleared
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write_or_remove(&path, || {
                        file.write_all(&raw).and_then(|()| file.sync_all())
                    })?;
                    debug!(lock = %path.display(), txid, "lock acquired");
                    return Ok(Self {
                        path,
                        txid: txid.to_string(),
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = inspect_holder(&path, stale_after)?;
                    match holder {
                        Holder::Stale(reason) => {
                            warn!(lock = %path.display(), reason, "clearing stale lock");
                            remove_file_if_exists(&path).with_context(|| {
                                format!("failed to clear stale lock: {}", path.display())
                            })?;
                        }
                        Holder::Active(metadata) => {
                            return Err(LockHeldError {
                                lock_path: path,
                                pid: metadata.pid,
                                txid: metadata.txid,
                                operation: metadata.operation,
                                acquired_at_unix: metadata.acquired_at_unix,
                            }
                            .into());
                        }
                    }
                }
                Err(err) => {
                    return Err(EngineError::Other(anyhow::Error::new(err).context(format!(
                        "failed to create lock file: {}",
                        path.display()
                    ))));
                }
            }
        }

        let metadata = read_lock(layout)?.unwrap_or_else(|| unknown_holder(0));
        Err(LockHeldError {
            lock_path: path,
            pid: metadata.pid,
            txid: metadata.txid,
            operation: metadata.operation,
            acquired_at_unix: metadata.acquired_at_unix,
        }
        .into())
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_if_owned(&self.path, &self.txid)
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release_if_owned(&self.path, &self.txid) {
            warn!(lock = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

pub fn read_lock(layout: &TargetLayout) -> Result<Option<LockMetadata>> {
    let path = layout.lock_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read lock file: {}", path.display()));
        }
    };
    Ok(serde_json::from_str(&raw).ok())
}

enum Holder {
    Active(LockMetadata),
    Stale(&'static str),
}

fn inspect_holder(path: &Path, stale_after: Duration) -> Result<Holder> {
    let now = current_unix_timestamp()?;
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        // released between our create attempt and this read
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Holder::Stale("vanished")),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read lock file: {}", path.display()));
        }
    };

    let Ok(metadata) = serde_json::from_str::<LockMetadata>(&raw) else {
        // a writer may still be filling the file; only its age can tell
        let modified = fs::metadata(path).map(|meta| mtime_unix(&meta)).unwrap_or(now);
        if now.saturating_sub(modified) > stale_after.as_secs() {
            return Ok(Holder::Stale("unreadable and expired"));
        }
        return Ok(Holder::Active(unknown_holder(modified)));
    };

    if now.saturating_sub(metadata.acquired_at_unix) > stale_after.as_secs() {
        return Ok(Holder::Stale("expired"));
    }
    if !process_alive(metadata.pid) {
        return Ok(Holder::Stale("owner process is gone"));
    }
    Ok(Holder::Active(metadata))
}

/// Runs `write` against a freshly created lock file and deletes the file
/// when it fails, so a half-written lock never blocks the target.
pub(crate) fn write_or_remove(path: &Path, write: impl FnOnce() -> io::Result<()>) -> Result<()> {
    let Err(err) = write() else {
        return Ok(());
    };
    if let Err(cleanup) = remove_file_if_exists(path) {
        warn!(lock = %path.display(), error = %cleanup, "failed to remove unwritten lock file");
    }
    Err(anyhow::Error::new(err).context(format!("failed to write lock file: {}", path.display())))
}

fn unknown_holder(acquired_at_unix: u64) -> LockMetadata {
    LockMetadata {
        version: LOCK_VERSION,
        pid: 0,
        txid: "unknown".to_string(),
        operation: "unknown".to_string(),
        acquired_at_unix,
    }
}

fn release_if_owned(path: &Path, txid: &str) -> Result<()> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read lock file: {}", path.display()));
        }
    };
    let owned = serde_json::from_str::<LockMetadata>(&raw)
        .map(|metadata| metadata.txid == txid)
        .unwrap_or(false);
    if owned {
        remove_file_if_exists(path)
            .with_context(|| format!("failed to remove lock file: {}", path.display()))?;
    }
    Ok(())
}
