use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use tempfile::NamedTempFile;

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Writes `bytes` next to `path` and renames over it, so readers observe
/// either the old content or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<()> {
    let mut temp = temp_sibling(path)?;
    temp.write_all(bytes)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    finish_atomic(temp, path, mode)
}

/// Copies `from` onto `to` through a temp sibling of `to`.
pub fn copy_atomic(from: &Path, to: &Path, mode: Option<u32>) -> Result<()> {
    let mut source =
        File::open(from).with_context(|| format!("failed to open {}", from.display()))?;
    let mut temp = temp_sibling(to)?;
    io::copy(&mut source, temp.as_file_mut()).with_context(|| {
        format!("failed to copy {} to {}", from.display(), to.display())
    })?;
    let mode = match mode {
        Some(mode) => Some(mode),
        None => file_mode(&fs::metadata(from).with_context(|| {
            format!("failed to stat {}", from.display())
        })?),
    };
    finish_atomic(temp, to, mode)
}

fn temp_sibling(path: &Path) -> Result<NamedTempFile> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| anyhow!("path has no parent directory: {}", path.display()))?;
    NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))
}

fn finish_atomic(temp: NamedTempFile, path: &Path, mode: Option<u32>) -> Result<()> {
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", path.display()))?;
    if let Some(mode) = mode {
        set_file_mode(temp.path(), mode)?;
    }
    temp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
pub fn file_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn file_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
pub fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set mode {mode:o} on {}", path.display()))
}

#[cfg(not(unix))]
pub fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

pub fn mtime_unix(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Nearest ancestor of `path` (or `path` itself) that exists on disk.
pub fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|candidate| !candidate.as_os_str().is_empty() && candidate.exists())
        .map(Path::to_path_buf)
}

pub fn is_dir_empty(path: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(entries.next().is_none())
}
