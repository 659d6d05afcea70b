use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use frameset_core::ContentHash;

use crate::error::EngineError;
use crate::fs_utils::mtime_unix;
use crate::types::METADATA_SCHEMA_VERSION;
use crate::{InstallationMetadata, InstalledFileRecord, TargetLayout};

/// Reads the installation metadata of `layout`; `None` when nothing is installed.
pub fn read_metadata(layout: &TargetLayout) -> Result<Option<InstallationMetadata>, EngineError> {
    let path = layout.metadata_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("failed to read installation metadata: {}", path.display()))
                .into());
        }
    };

    let metadata: InstallationMetadata =
        serde_json::from_str(&raw).map_err(|err| EngineError::Corrupted {
            path: path.clone(),
            reason: err.to_string(),
        })?;
    if metadata.schema_version != METADATA_SCHEMA_VERSION {
        return Err(EngineError::Corrupted {
            path,
            reason: format!(
                "unsupported schema version {} (expected {})",
                metadata.schema_version, METADATA_SCHEMA_VERSION
            ),
        });
    }
    Ok(Some(metadata))
}

/// Like [`read_metadata`], but a missing installation is an error.
pub fn require_metadata(layout: &TargetLayout) -> Result<InstallationMetadata, EngineError> {
    read_metadata(layout)?.ok_or_else(|| EngineError::NotInstalled {
        root: layout.root().to_path_buf(),
    })
}

/// Builds a record from the file as it is on disk now.
pub fn record_from_disk(
    layout: &TargetLayout,
    rel: &Path,
    component: &str,
    user_modified: bool,
) -> Result<InstalledFileRecord> {
    let absolute = layout.resolve(rel);
    let metadata =
        fs::metadata(&absolute).with_context(|| format!("failed to stat {}", absolute.display()))?;
    Ok(InstalledFileRecord {
        path: rel.to_path_buf(),
        content_hash: ContentHash::of_file(&absolute)?,
        size: metadata.len(),
        mtime_unix: mtime_unix(&metadata),
        component: component.to_string(),
        user_modified,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskState {
    Missing,
    /// Something other than a regular file occupies the path.
    NotAFile,
    File(ContentHash),
}

impl DiskState {
    pub fn read(layout: &TargetLayout, rel: &Path) -> Result<Self> {
        let absolute = layout.resolve(rel);
        match fs::symlink_metadata(&absolute) {
            Ok(meta) if meta.is_file() => Ok(Self::File(ContentHash::of_file(&absolute)?)),
            Ok(_) => Ok(Self::NotAFile),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::Missing),
            Err(err) => Err(err).with_context(|| format!("failed to stat {}", absolute.display())),
        }
    }
}

/// True when the on-disk content no longer matches what was installed.
pub fn is_user_modified(record: &InstalledFileRecord, disk: &DiskState) -> bool {
    match disk {
        DiskState::File(hash) => record.user_modified || hash != &record.content_hash,
        DiskState::NotAFile => true,
        DiskState::Missing => false,
    }
}
