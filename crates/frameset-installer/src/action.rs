use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use frameset_core::ContentHash;
use serde::{Deserialize, Serialize};

use crate::fs_utils::{copy_atomic, is_dir_empty, write_atomic};
use crate::snapshot::PriorState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ContentSource {
    /// Absolute path of a file in the source tree.
    Copy { from: PathBuf },
    Inline { text: String },
}

/// One reversible filesystem mutation. Paths are relative to the target root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    CreateDirectory {
        path: PathBuf,
    },
    Create {
        path: PathBuf,
        content: ContentSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    Update {
        path: PathBuf,
        content: ContentSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    Delete {
        path: PathBuf,
    },
    /// Copies `from` to the backup location `path`.
    Backup {
        path: PathBuf,
        from: PathBuf,
    },
    /// Removes a directory when it is empty; a non-empty directory is left alone.
    RemoveDirectory {
        path: PathBuf,
    },
}

impl Action {
    /// The path this action mutates.
    pub fn path(&self) -> &Path {
        match self {
            Self::CreateDirectory { path }
            | Self::Create { path, .. }
            | Self::Update { path, .. }
            | Self::Delete { path }
            | Self::Backup { path, .. }
            | Self::RemoveDirectory { path } => path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateDirectory { .. } => "create_directory",
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Backup { .. } => "backup",
            Self::RemoveDirectory { .. } => "remove_directory",
        }
    }

    /// Rejects paths that leave `root`, either textually or through a
    /// symlinked directory inside it.
    pub fn check_paths(&self, root: &Path) -> Result<()> {
        check_relative(self.path())?;
        check_no_symlinked_ancestor(root, self.path())?;
        if let Self::Backup { from, .. } = self {
            check_relative(from)?;
            check_no_symlinked_ancestor(root, from)?;
        }
        Ok(())
    }

    /// Performs the action against `root`.
    pub fn apply(&self, root: &Path) -> Result<()> {
        let target = root.join(self.path());
        match self {
            Self::CreateDirectory { .. } => match fs::create_dir(&target) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && target.is_dir() => Ok(()),
                Err(err) => Err(err)
                    .with_context(|| format!("failed to create directory {}", target.display())),
            },
            Self::Create { content, mode, .. } | Self::Update { content, mode, .. } => {
                if target.is_dir() {
                    return Err(anyhow!("{} is a directory", target.display()));
                }
                match content {
                    ContentSource::Copy { from } => copy_atomic(from, &target, *mode),
                    ContentSource::Inline { text } => write_atomic(&target, text.as_bytes(), *mode),
                }
            }
            Self::Delete { .. } => match fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() => {
                    Err(anyhow!("refusing to delete directory {}", target.display()))
                }
                Ok(_) => fs::remove_file(&target)
                    .with_context(|| format!("failed to delete {}", target.display())),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("failed to stat {}", target.display()))
                }
            },
            Self::Backup { from, .. } => {
                let source = root.join(from);
                copy_atomic(&source, &target, None).with_context(|| {
                    format!("failed to back up {} to {}", source.display(), target.display())
                })
            }
            Self::RemoveDirectory { .. } => {
                if !target.is_dir() || !is_dir_empty(&target)? {
                    return Ok(());
                }
                fs::remove_dir(&target)
                    .with_context(|| format!("failed to remove directory {}", target.display()))
            }
        }
    }

    /// The compensating step for this action given the state its path had
    /// before the transaction first touched it.
    pub fn inverse(&self, prior: &PriorState) -> Inverse {
        match (prior, self) {
            (PriorState::Absent, Self::CreateDirectory { .. }) => Inverse::RemoveEmptyDirectory,
            (
                PriorState::Absent,
                Self::Create { .. } | Self::Update { .. } | Self::Backup { .. },
            ) => Inverse::Remove,
            (PriorState::Absent, Self::Delete { .. } | Self::RemoveDirectory { .. }) => {
                Inverse::Nothing
            }
            (PriorState::File { hash, mode, .. }, _) => Inverse::RestoreFile {
                hash: hash.clone(),
                mode: *mode,
            },
            (PriorState::Directory { .. }, Self::CreateDirectory { .. }) => Inverse::Nothing,
            (PriorState::Directory { mode }, _) => Inverse::RestoreDirectory { mode: *mode },
            (PriorState::Symlink { target }, _) => Inverse::RestoreSymlink {
                target: target.clone(),
            },
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup { path, from } => {
                write!(f, "backup {} -> {}", from.display(), path.display())
            }
            other => write!(f, "{} {}", other.kind(), other.path().display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inverse {
    Nothing,
    Remove,
    RemoveEmptyDirectory,
    RestoreFile { hash: ContentHash, mode: Option<u32> },
    RestoreDirectory { mode: Option<u32> },
    RestoreSymlink { target: PathBuf },
}

pub(crate) fn check_no_symlinked_ancestor(root: &Path, path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(anyhow!(
                    "action path {} passes through symlink {}",
                    path.display(),
                    current.display()
                ));
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", current.display()));
            }
        }
    }
    Ok(())
}

fn check_relative(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(anyhow!("action path must not be empty"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(anyhow!("action path escapes the target root: {}", path.display())),
        }
    }
    Ok(())
}
