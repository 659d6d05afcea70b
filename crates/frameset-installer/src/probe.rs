use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sysinfo::{Disks, System};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::fs_utils::nearest_existing_ancestor;
use crate::metadata::read_metadata;
use crate::{InstallationMetadata, TargetLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentReport {
    pub platform: String,
    pub target: PathBuf,
    pub writable: bool,
    /// Free bytes on the volume holding the target; `None` when unknown.
    pub free_bytes: Option<u64>,
    pub existing_installation: Option<InstallationMetadata>,
}

impl EnvironmentReport {
    /// Checks the target can take an operation that needs `required_bytes`.
    pub fn preflight(&self, required_bytes: Option<u64>) -> Result<(), EngineError> {
        if !self.writable {
            return Err(EngineError::PermissionDenied {
                root: self.target.clone(),
            });
        }
        if let (Some(required), Some(available)) = (required_bytes, self.free_bytes) {
            if available < required {
                return Err(EngineError::InsufficientSpace {
                    required,
                    available,
                });
            }
        }
        Ok(())
    }
}

pub fn probe_environment(layout: &TargetLayout) -> Result<EnvironmentReport, EngineError> {
    let target = layout.root().to_path_buf();
    let anchor = nearest_existing_ancestor(&target)
        .ok_or_else(|| anyhow!("no existing ancestor for target {}", target.display()))?;

    let writable = probe_writable(&anchor);
    let free_bytes = free_bytes_for(&anchor);
    if free_bytes.is_none() {
        warn!(target = %target.display(), "could not determine free disk space");
    }
    let existing_installation = read_metadata(layout)?;

    let report = EnvironmentReport {
        platform: platform_name(),
        target,
        writable,
        free_bytes,
        existing_installation,
    };
    debug!(
        platform = %report.platform,
        writable = report.writable,
        free_bytes = ?report.free_bytes,
        installed = report.existing_installation.is_some(),
        "environment probed"
    );
    Ok(report)
}

/// Runs [`probe_environment`] on a worker thread, giving up after `timeout`.
pub fn probe_environment_with_timeout(
    layout: &TargetLayout,
    timeout: Duration,
) -> Result<EnvironmentReport, EngineError> {
    let (sender, receiver) = mpsc::channel();
    let worker_layout = layout.clone();
    thread::Builder::new()
        .name("frameset-probe".to_string())
        .spawn(move || {
            let _ = sender.send(probe_environment(&worker_layout));
        })
        .context("failed to spawn environment probe")?;

    match receiver.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(anyhow!(
            "environment probe of {} timed out after {}s",
            layout.root().display(),
            timeout.as_secs()
        )
        .into()),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(anyhow!("environment probe exited without a result").into())
        }
    }
}

fn probe_writable(dir: &Path) -> bool {
    match tempfile::Builder::new()
        .prefix(".frameset-probe")
        .tempfile_in(dir)
    {
        Ok(file) => {
            drop(file);
            true
        }
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "write probe failed");
            false
        }
    }
}

fn free_bytes_for(dir: &Path) -> Option<u64> {
    let resolved = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count())
        .map(|disk| disk.available_space())
}

fn platform_name() -> String {
    let os = System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string());
    format!("{os} ({})", std::env::consts::ARCH)
}
