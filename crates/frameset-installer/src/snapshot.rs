//! Pre-mutation snapshots.
//!
//! Each transaction owns `transactions/staging/<txid>/`, holding an
//! append-only `index.jsonl` and content-addressed copies of every file it
//! touched under `blobs/`. A path is captured only the first time the
//! transaction touches it, so the snapshot always describes the state from
//! before the transaction began.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use frameset_core::ContentHash;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::action::Inverse;
use crate::fs_utils::{copy_atomic, file_mode, is_dir_empty, set_file_mode};
use crate::TargetLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PriorState {
    Absent,
    File {
        hash: ContentHash,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    Directory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    Symlink {
        target: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: PathBuf,
    pub prior: PriorState,
}

#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    dir: PathBuf,
    entries: HashMap<PathBuf, SnapshotEntry>,
    index: Option<File>,
}

impl SnapshotStore {
    pub fn create(layout: &TargetLayout, txid: &str) -> Result<Self> {
        let dir = layout.transaction_staging_path(txid);
        fs::create_dir_all(dir.join("blobs"))
            .with_context(|| format!("failed to create snapshot store: {}", dir.display()))?;
        let index = open_index(&dir)?;
        Ok(Self {
            root: layout.root().to_path_buf(),
            dir,
            entries: HashMap::new(),
            index: Some(index),
        })
    }

    /// Reopens the store of an earlier transaction. A missing store opens empty.
    pub fn open(layout: &TargetLayout, txid: &str) -> Result<Self> {
        let dir = layout.transaction_staging_path(txid);
        let index_path = dir.join("index.jsonl");
        let raw = match fs::read_to_string(&index_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read snapshot index: {}", index_path.display())
                });
            }
        };

        let mut entries = HashMap::new();
        let lines = raw.lines().filter(|line| !line.trim().is_empty()).collect::<Vec<_>>();
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<SnapshotEntry>(line) {
                Ok(entry) => {
                    entries.entry(entry.path.clone()).or_insert(entry);
                }
                // a torn final line is the only damage an interrupted append can leave;
                // the action it belonged to was never journaled
                Err(_) if index + 1 == lines.len() => {
                    warn!(index = %index_path.display(), "ignoring torn snapshot record");
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("corrupted snapshot index: {}", index_path.display())
                    });
                }
            }
        }

        Ok(Self {
            root: layout.root().to_path_buf(),
            dir,
            entries,
            index: None,
        })
    }

    pub fn get(&self, path: &Path) -> Option<&SnapshotEntry> {
        self.entries.get(path)
    }

    /// Records the current state of `path` unless it was captured already.
    /// The record and any blob are durable before this returns.
    pub fn capture(&mut self, path: &Path) -> Result<&SnapshotEntry> {
        if !self.entries.contains_key(path) {
            let prior = self.read_prior(path)?;
            let entry = SnapshotEntry {
                path: path.to_path_buf(),
                prior,
            };
            let mut line =
                serde_json::to_string(&entry).context("failed to serialize snapshot entry")?;
            line.push('\n');
            if self.index.is_none() {
                self.index = Some(open_index(&self.dir)?);
            }
            let index = self
                .index
                .as_mut()
                .ok_or_else(|| anyhow!("snapshot index is not open"))?;
            index
                .write_all(line.as_bytes())
                .and_then(|()| index.sync_data())
                .with_context(|| format!("failed to append snapshot index in {}", self.dir.display()))?;
            self.entries.insert(path.to_path_buf(), entry);
        }
        self.entries
            .get(path)
            .ok_or_else(|| anyhow!("snapshot for {} vanished", path.display()))
    }

    fn read_prior(&self, path: &Path) -> Result<PriorState> {
        let absolute = self.root.join(path);
        let metadata = match fs::symlink_metadata(&absolute) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(PriorState::Absent),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to stat {}", absolute.display()));
            }
        };

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&absolute)
                .with_context(|| format!("failed to read link {}", absolute.display()))?;
            return Ok(PriorState::Symlink { target });
        }
        if metadata.is_dir() {
            return Ok(PriorState::Directory {
                mode: file_mode(&metadata),
            });
        }

        let hash = ContentHash::of_file(&absolute)?;
        let blob = self.blob_path(&hash);
        if !blob.exists() {
            copy_atomic(&absolute, &blob, None)
                .with_context(|| format!("failed to snapshot {}", absolute.display()))?;
        }
        Ok(PriorState::File {
            hash,
            size: metadata.len(),
            mode: file_mode(&metadata),
        })
    }

    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.dir.join("blobs").join(hash.as_str())
    }

    /// Brings `path` back to the captured state. Safe to repeat.
    pub fn apply_inverse(&self, path: &Path, inverse: &Inverse) -> Result<()> {
        let absolute = self.root.join(path);
        match inverse {
            Inverse::Nothing => Ok(()),
            Inverse::Remove => remove_any(&absolute),
            Inverse::RemoveEmptyDirectory => match fs::symlink_metadata(&absolute) {
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("failed to stat {}", absolute.display()))
                }
                Ok(meta) if meta.is_dir() => {
                    if !is_dir_empty(&absolute)? {
                        return Err(anyhow!(
                            "directory {} is not empty",
                            absolute.display()
                        ));
                    }
                    fs::remove_dir(&absolute).with_context(|| {
                        format!("failed to remove directory {}", absolute.display())
                    })
                }
                Ok(_) => remove_any(&absolute),
            },
            Inverse::RestoreFile { hash, mode } => {
                if absolute.is_dir() {
                    fs::remove_dir(&absolute).with_context(|| {
                        format!("failed to clear directory {} for restore", absolute.display())
                    })?;
                }
                let current = match fs::symlink_metadata(&absolute) {
                    Ok(meta) if meta.is_file() => ContentHash::of_file(&absolute).ok(),
                    Ok(_) => {
                        remove_any(&absolute)?;
                        None
                    }
                    Err(_) => None,
                };
                if current.as_ref() != Some(hash) {
                    let blob = self.blob_path(hash);
                    if !blob.exists() {
                        return Err(anyhow!("snapshot blob {} is missing", blob.display()));
                    }
                    if let Some(parent) = absolute.parent() {
                        fs::create_dir_all(parent).with_context(|| {
                            format!("failed to create {}", parent.display())
                        })?;
                    }
                    copy_atomic(&blob, &absolute, *mode)?;
                } else if let Some(mode) = mode {
                    set_file_mode(&absolute, *mode)?;
                }
                Ok(())
            }
            Inverse::RestoreDirectory { mode } => {
                if !absolute.is_dir() {
                    if fs::symlink_metadata(&absolute).is_ok() {
                        remove_any(&absolute)?;
                    }
                    fs::create_dir_all(&absolute).with_context(|| {
                        format!("failed to recreate directory {}", absolute.display())
                    })?;
                }
                if let Some(mode) = mode {
                    set_file_mode(&absolute, *mode)?;
                }
                Ok(())
            }
            Inverse::RestoreSymlink { target } => {
                if let Ok(existing) = fs::read_link(&absolute) {
                    if &existing == target {
                        return Ok(());
                    }
                }
                if fs::symlink_metadata(&absolute).is_ok() {
                    remove_any(&absolute)?;
                }
                create_symlink(target, &absolute)
            }
        }
    }

    /// Deletes the staging directory once its contents are no longer needed.
    pub fn discard(self) -> Result<()> {
        drop(self.index);
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove snapshot store {}", self.dir.display())),
        }
    }
}

fn open_index(dir: &Path) -> Result<File> {
    let path = dir.join("index.jsonl");
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open snapshot index: {}", path.display()))
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", path.display())),
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir(path).with_context(|| format!("failed to remove {}", path.display()))
        }
        Ok(_) => {
            fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
        }
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("failed to restore symlink {}", link.display()))
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(anyhow!(
        "restoring symlink {} is not supported on this platform",
        link.display()
    ))
}
