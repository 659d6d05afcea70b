use std::path::PathBuf;

use anyhow::Result;
use frameset_core::ContentHash;

use crate::error::VerificationError;
use crate::metadata::DiskState;
use crate::{InstallationMetadata, TargetLayout};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: usize,
    pub missing: Vec<PathBuf>,
    /// Files whose content no longer matches the recorded hash.
    pub modified: Vec<PathBuf>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.modified.is_empty()
    }

    /// Missing framework files fail verification; local edits do not.
    pub fn into_result(self) -> Result<Self, VerificationError> {
        if self.missing.is_empty() {
            Ok(self)
        } else {
            Err(VerificationError {
                missing: self.missing,
                mismatched: self.modified,
            })
        }
    }
}

pub fn verify_installation(
    layout: &TargetLayout,
    metadata: &InstallationMetadata,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    for record in &metadata.files {
        report.checked += 1;
        match DiskState::read(layout, &record.path)? {
            DiskState::Missing => report.missing.push(record.path.clone()),
            DiskState::NotAFile => report.modified.push(record.path.clone()),
            DiskState::File(hash) if hash != record.content_hash => {
                report.modified.push(record.path.clone());
            }
            DiskState::File(_) => {}
        }
    }
    Ok(report)
}

/// Checks freshly written files against the hashes they were planned with.
pub(crate) fn verify_written(
    layout: &TargetLayout,
    written: &[(PathBuf, ContentHash)],
) -> Result<(), VerificationError> {
    let mut failure = VerificationError::default();
    for (path, expected) in written {
        match DiskState::read(layout, path) {
            Ok(DiskState::File(hash)) if &hash == expected => {}
            Ok(DiskState::Missing) => failure.missing.push(path.clone()),
            Ok(_) | Err(_) => failure.mismatched.push(path.clone()),
        }
    }
    if failure.missing.is_empty() && failure.mismatched.is_empty() {
        Ok(())
    } else {
        Err(failure)
    }
}
