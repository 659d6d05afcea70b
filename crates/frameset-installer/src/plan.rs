use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Component as PathComponent, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use frameset_core::{select_files, validate_relative_path, ContentHash, Manifest};
use tracing::warn;

use crate::action::{check_no_symlinked_ancestor, Action};
use crate::error::EngineError;
use crate::fs_utils::file_mode;
use crate::TargetLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedComponent {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedFile {
    pub component: String,
    /// Absolute path in the source tree.
    pub source: PathBuf,
    /// Path relative to the target root.
    pub target: PathBuf,
    pub hash: ContentHash,
    pub mode: Option<u32>,
    pub merge: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedComponent {
    pub name: String,
    pub required: bool,
    pub files: Vec<ResolvedFile>,
}

#[derive(Debug, Default)]
pub(crate) struct Resolution {
    pub components: Vec<ResolvedComponent>,
    pub skipped: Vec<SkippedComponent>,
}

impl Resolution {
    pub fn file(&self, target: &Path) -> Option<&ResolvedFile> {
        self.components
            .iter()
            .flat_map(|component| component.files.iter())
            .find(|file| file.target == target)
    }

    pub fn is_skipped(&self, component: &str) -> bool {
        self.skipped.iter().any(|skipped| skipped.name == component)
    }
}

/// Resolves every component of `manifest` against `source_root`. Missing
/// sources fail required components and skip optional ones; a component
/// whose dependency was skipped is treated the same way.
pub(crate) fn resolve_components(
    manifest: &Manifest,
    source_root: &Path,
    layout: &TargetLayout,
) -> Result<Resolution, EngineError> {
    let mut resolution = Resolution::default();
    let mut available = HashSet::new();
    let mut claimed: HashMap<PathBuf, String> = HashMap::new();

    for component in &manifest.components {
        let unavailable = match resolve_one(component, source_root, &available) {
            Ok(files) if files.is_empty() => Some("no source files matched its patterns".to_string()),
            Ok(files) => {
                for file in &files {
                    if layout.is_reserved(&file.target) {
                        return Err(anyhow!(
                            "component '{}' targets reserved path {}",
                            component.name,
                            file.target.display()
                        )
                        .into());
                    }
                    if let Some(owner) = claimed.insert(file.target.clone(), component.name.clone()) {
                        return Err(anyhow!(
                            "{} is claimed by both components '{}' and '{}'",
                            file.target.display(),
                            owner,
                            component.name
                        )
                        .into());
                    }
                }
                available.insert(component.name.clone());
                resolution.components.push(ResolvedComponent {
                    name: component.name.clone(),
                    required: component.required,
                    files,
                });
                None
            }
            Err(err) => Some(format!("{err:#}")),
        };

        if let Some(reason) = unavailable {
            if component.required {
                return Err(EngineError::MissingDependency {
                    component: component.name.clone(),
                    reason,
                });
            }
            warn!(component = %component.name, reason = %reason, "skipping optional component");
            resolution.skipped.push(SkippedComponent {
                name: component.name.clone(),
                reason,
            });
        }
    }
    Ok(resolution)
}

fn resolve_one(
    component: &frameset_core::Component,
    source_root: &Path,
    available: &HashSet<String>,
) -> Result<Vec<ResolvedFile>> {
    if let Some(missing) = component
        .depends_on
        .iter()
        .find(|dependency| !available.contains(dependency.as_str()))
    {
        return Err(anyhow!("dependency '{missing}' is unavailable"));
    }

    let source_dir = source_root.join(&component.source);
    if !source_dir.is_dir() {
        return Err(anyhow!("source directory not found: {}", source_dir.display()));
    }

    let patterns = component.pattern_set()?;
    let merge = component.merge_set()?;
    let target_dir = normalize(Path::new(&component.target));
    let mut files = Vec::new();
    for rel in select_files(&source_dir, &patterns)? {
        let source = source_dir.join(&rel);
        let metadata = fs::metadata(&source)
            .with_context(|| format!("failed to stat {}", source.display()))?;
        files.push(ResolvedFile {
            component: component.name.clone(),
            hash: ContentHash::of_file(&source)?,
            mode: file_mode(&metadata),
            merge: merge.matches(&rel),
            target: target_dir.join(&rel),
            source,
        });
    }
    Ok(files)
}

/// Drops `.` components so `./a` and `a` name the same record.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, PathComponent::CurDir))
        .collect()
}

/// Tracked paths loaded from metadata are only acted on when they stay
/// inside the root and outside the engine's own directories.
pub(crate) fn is_safe_record(layout: &TargetLayout, path: &Path) -> bool {
    path.to_str()
        .is_some_and(|raw| validate_relative_path(raw).is_ok())
        && !layout.is_reserved(path)
        && check_no_symlinked_ancestor(layout.root(), path).is_ok()
}

/// Ancestors of `targets` that do not exist yet, parents before children.
pub(crate) fn missing_directories<'a>(
    layout: &TargetLayout,
    targets: impl IntoIterator<Item = &'a Path>,
) -> Vec<PathBuf> {
    let mut missing = BTreeSet::new();
    for target in targets {
        for ancestor in target.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            if layout.resolve(ancestor).is_dir() {
                break;
            }
            missing.insert(ancestor.to_path_buf());
        }
    }
    missing.into_iter().collect()
}

/// `RemoveDirectory` actions for the ancestors of `deleted`, deepest first.
pub(crate) fn prune_directories<'a>(deleted: impl IntoIterator<Item = &'a Path>) -> Vec<Action> {
    let mut dirs = BTreeSet::new();
    for path in deleted {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            dirs.insert(ancestor.to_path_buf());
        }
    }
    dirs.into_iter()
        .rev()
        .map(|path| Action::RemoveDirectory { path })
        .collect()
}

/// Plans the backup directory for `operation` and the copies into it.
pub(crate) struct BackupPlan {
    pub dir: PathBuf,
    pub actions: Vec<Action>,
}

pub(crate) fn plan_backups<'a>(
    layout: &TargetLayout,
    operation: &str,
    sources: impl IntoIterator<Item = &'a Path>,
) -> Option<BackupPlan> {
    let sources = sources.into_iter().collect::<Vec<_>>();
    if sources.is_empty() {
        return None;
    }

    let dir = unique_backup_dir(layout, operation);
    let mut dirs = BTreeSet::new();
    for ancestor in dir.ancestors() {
        if ancestor.as_os_str().is_empty() || layout.resolve(ancestor).is_dir() {
            break;
        }
        dirs.insert(ancestor.to_path_buf());
    }
    for source in &sources {
        for ancestor in source.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            dirs.insert(dir.join(ancestor));
        }
    }

    let mut actions = dirs
        .into_iter()
        .map(|path| Action::CreateDirectory { path })
        .collect::<Vec<_>>();
    actions.extend(sources.iter().map(|source| Action::Backup {
        path: dir.join(source),
        from: source.to_path_buf(),
    }));
    Some(BackupPlan { dir, actions })
}

fn unique_backup_dir(layout: &TargetLayout, operation: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let base = layout.backups_rel_dir().join(format!("{operation}-{stamp}"));
    if !layout.resolve(&base).exists() {
        return base;
    }
    (1..)
        .map(|n| layout.backups_rel_dir().join(format!("{operation}-{stamp}-{n}")))
        .find(|candidate| !layout.resolve(candidate).exists())
        .unwrap_or(base)
}
