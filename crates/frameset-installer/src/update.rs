use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use frameset_core::{ContentHash, Manifest};
use semver::Version;
use tracing::{info, warn};

use crate::action::{Action, ContentSource};
use crate::engine::{MetadataChange, RecoveryReport, TransactionEngine};
use crate::error::{AbortCause, ActionErrorKind, EngineError, PreservationError};
use crate::merge::{merge_config_text, MergeMode};
use crate::metadata::{record_from_disk, DiskState};
use crate::plan::{
    is_safe_record, missing_directories, plan_backups, prune_directories, resolve_components,
    ResolvedFile, SkippedComponent,
};
use crate::probe::EnvironmentReport;
use crate::transactions::current_unix_timestamp;
use crate::verify::verify_written;
use crate::{ComponentState, InstallationMetadata, InstalledFileRecord, Operation, TargetLayout};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Keep every user-modified or untracked file, and skip merges.
    pub preserve_all: bool,
    /// Merge config files recursively instead of top-level only.
    pub merge_config: bool,
    /// Overwrite user-modified files.
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub txid: Option<String>,
    pub dry_run: bool,
    pub plan: Vec<Action>,
    pub from_version: Version,
    pub to_version: Version,
    pub updated_files: Vec<PathBuf>,
    pub created_files: Vec<PathBuf>,
    pub merged_files: Vec<PathBuf>,
    pub preserved_files: Vec<PathBuf>,
    pub deleted_files: Vec<PathBuf>,
    pub unchanged_files: Vec<PathBuf>,
    pub backup_path: Option<PathBuf>,
    pub skipped: Vec<SkippedComponent>,
    pub metadata: Option<InstallationMetadata>,
    pub recovered: Vec<RecoveryReport>,
}

/// What the update does with one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDecision {
    Create,
    Update,
    Merge,
    Preserve,
    Delete,
    Unchanged,
    /// Untracked file identical to the framework copy; it becomes tracked.
    Adopt,
    /// Tracked file that is gone and no longer shipped; only its record is dropped.
    Forget,
}

pub(crate) fn classify(
    incoming: Option<&ResolvedFileView<'_>>,
    record: Option<&InstalledFileRecord>,
    disk: &DiskState,
    options: &UpdateOptions,
) -> FileDecision {
    match incoming {
        Some(file) => {
            let current = match disk {
                DiskState::Missing => return FileDecision::Create,
                DiskState::NotAFile => return FileDecision::Preserve,
                DiskState::File(hash) => hash,
            };
            if current == file.hash {
                return match record {
                    Some(_) => FileDecision::Unchanged,
                    None => FileDecision::Adopt,
                };
            }
            let modified = match record {
                Some(record) => record.user_modified || current != &record.content_hash,
                None => true,
            };
            if !modified {
                FileDecision::Update
            } else if options.preserve_all {
                FileDecision::Preserve
            } else if options.force {
                FileDecision::Update
            } else if file.merge {
                FileDecision::Merge
            } else {
                FileDecision::Preserve
            }
        }
        None => {
            let Some(record) = record else {
                return FileDecision::Unchanged;
            };
            match disk {
                DiskState::Missing => FileDecision::Forget,
                DiskState::NotAFile => FileDecision::Preserve,
                DiskState::File(hash) => {
                    let modified = record.user_modified || hash != &record.content_hash;
                    if options.preserve_all || (modified && !options.force) {
                        FileDecision::Preserve
                    } else {
                        FileDecision::Delete
                    }
                }
            }
        }
    }
}

/// The parts of an incoming file [`classify`] looks at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedFileView<'a> {
    pub hash: &'a ContentHash,
    pub merge: bool,
}

impl<'a> From<&'a ResolvedFile> for ResolvedFileView<'a> {
    fn from(file: &'a ResolvedFile) -> Self {
        Self {
            hash: &file.hash,
            merge: file.merge,
        }
    }
}

#[derive(Debug, Clone)]
struct Step {
    target: PathBuf,
    component: String,
    decision: FileDecision,
    /// Content written by `Create`, `Update` and `Merge`.
    write: Option<(ContentSource, ContentHash, Option<u32>)>,
    on_disk: bool,
}

impl Step {
    fn action(&self) -> Option<Action> {
        let (content, _, mode) = self.write.clone()?;
        let path = self.target.clone();
        match self.decision {
            FileDecision::Create => Some(Action::Create { path, content, mode }),
            FileDecision::Update | FileDecision::Merge => Some(Action::Update { path, content, mode }),
            _ => None,
        }
    }
}

pub fn update(
    engine: &TransactionEngine,
    manifest: &Manifest,
    source_root: &Path,
    existing: &InstallationMetadata,
    environment: &EnvironmentReport,
    options: UpdateOptions,
) -> Result<UpdateResult, EngineError> {
    environment.preflight(manifest.min_free_bytes)?;
    let layout = engine.layout();
    let resolution = resolve_components(manifest, source_root, layout)?;
    let merge_mode = if options.merge_config {
        MergeMode::Deep
    } else {
        MergeMode::Shallow
    };

    let mut steps = Vec::new();
    for component in &resolution.components {
        for file in &component.files {
            let record = existing.record(&file.target);
            let disk = DiskState::read(layout, &file.target)?;
            let mut decision = classify(Some(&file.into()), record, &disk, &options);
            let mut write = Some((
                ContentSource::Copy {
                    from: file.source.clone(),
                },
                file.hash.clone(),
                file.mode,
            ));
            if decision == FileDecision::Merge {
                match merged_content(layout, file, merge_mode) {
                    Ok(Some(text)) => {
                        let hash = ContentHash::of_bytes(text.as_bytes());
                        write = Some((ContentSource::Inline { text }, hash, file.mode));
                    }
                    Ok(None) => decision = FileDecision::Preserve,
                    Err(err) => {
                        warn!(path = %file.target.display(), error = %format!("{err:#}"), "cannot merge config; preserving it");
                        decision = FileDecision::Preserve;
                    }
                }
            }
            if !matches!(
                decision,
                FileDecision::Create | FileDecision::Update | FileDecision::Merge
            ) {
                write = None;
            }
            steps.push(Step {
                target: file.target.clone(),
                component: component.name.clone(),
                decision,
                write,
                on_disk: !matches!(disk, DiskState::Missing),
            });
        }
    }

    for record in &existing.files {
        if resolution.file(&record.path).is_some() || resolution.is_skipped(&record.component) {
            continue;
        }
        if !is_safe_record(layout, &record.path) {
            warn!(path = %record.path.display(), "refusing to touch unsafe tracked path");
            continue;
        }
        let disk = DiskState::read(layout, &record.path)?;
        let decision = classify(None, Some(record), &disk, &options);
        steps.push(Step {
            target: record.path.clone(),
            component: record.component.clone(),
            decision,
            write: None,
            on_disk: !matches!(disk, DiskState::Missing),
        });
    }

    let backup = plan_backups(
        layout,
        "update",
        steps
            .iter()
            .filter(|step| {
                step.on_disk
                    && matches!(
                        step.decision,
                        FileDecision::Update | FileDecision::Merge | FileDecision::Delete
                    )
            })
            .map(|step| step.target.as_path()),
    );
    let directories = missing_directories(
        layout,
        steps
            .iter()
            .filter(|step| step.write.is_some())
            .map(|step| step.target.as_path()),
    );
    let deleted = steps
        .iter()
        .filter(|step| step.decision == FileDecision::Delete)
        .map(|step| step.target.clone())
        .collect::<Vec<_>>();
    let prunes = prune_directories(deleted.iter().map(PathBuf::as_path));

    let mut plan = Vec::new();
    if let Some(backup) = &backup {
        plan.extend(backup.actions.iter().cloned());
    }
    plan.extend(directories.iter().map(|path| Action::CreateDirectory { path: path.clone() }));
    plan.extend(steps.iter().filter_map(Step::action));
    plan.extend(deleted.iter().map(|path| Action::Delete { path: path.clone() }));
    plan.extend(prunes.iter().cloned());

    let mut result = UpdateResult {
        txid: None,
        dry_run: options.dry_run,
        plan,
        from_version: existing.version.clone(),
        to_version: manifest.version.clone(),
        updated_files: Vec::new(),
        created_files: Vec::new(),
        merged_files: Vec::new(),
        preserved_files: Vec::new(),
        deleted_files: Vec::new(),
        unchanged_files: Vec::new(),
        backup_path: backup.as_ref().map(|backup| layout.resolve(&backup.dir)),
        skipped: resolution.skipped.clone(),
        metadata: None,
        recovered: Vec::new(),
    };

    if options.dry_run {
        for action in &result.plan {
            info!(action = %action, "would apply");
        }
        fill_file_lists(&mut result, &steps, &[]);
        return Ok(result);
    }

    let now = current_unix_timestamp()?;
    if result.plan.is_empty() {
        let candidate = build_metadata(layout, existing, manifest, &resolution.skipped, &steps, now)?;
        if same_tracking(&candidate, existing) {
            info!(version = %manifest.version, "installation is already up to date");
            fill_file_lists(&mut result, &steps, &[]);
            result.backup_path = None;
            return Ok(result);
        }
    }

    let mut tx = engine.begin(Operation::Update)?;
    result.recovered = tx.recovered().to_vec();

    if let Some(backup) = &backup {
        for action in backup.actions.iter().cloned() {
            let source = match &action {
                Action::Backup { from, .. } => from.clone(),
                other => other.path().to_path_buf(),
            };
            if let Err(err) = engine.execute(&mut tx, action) {
                let cause = if err.kind == ActionErrorKind::Cancelled {
                    AbortCause::Action(err)
                } else {
                    AbortCause::Preservation(PreservationError {
                        txid: err.txid.clone(),
                        path: source,
                        backup: layout.resolve(&backup.dir),
                        reason: err.reason.clone(),
                    })
                };
                return Err(engine.abort(tx, cause));
            }
        }
    }

    for path in directories {
        if let Err(err) = engine.execute(&mut tx, Action::CreateDirectory { path }) {
            return Err(engine.abort(tx, AbortCause::Action(err)));
        }
    }

    let mut skipped = resolution.skipped.clone();
    for component in &resolution.components {
        let actions = steps
            .iter()
            .filter(|step| step.component == component.name)
            .filter_map(Step::action)
            .collect::<Vec<_>>();
        if actions.is_empty() {
            continue;
        }
        let checkpoint = engine.checkpoint(&tx);
        match engine.execute_batch(&mut tx, Some(&component.name), actions) {
            Ok(()) => {}
            Err(err) if component.required || err.kind == ActionErrorKind::Cancelled => {
                return Err(engine.abort(tx, AbortCause::Action(err)));
            }
            Err(err) => {
                warn!(component = %component.name, error = %err, "optional component failed; undoing its changes");
                if let Err(undo) = engine.rollback_to(&mut tx, checkpoint) {
                    warn!(component = %component.name, error = %undo, "could not undo optional component");
                    return Err(engine.abort(tx, AbortCause::Action(err)));
                }
                skipped.push(SkippedComponent {
                    name: component.name.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    for action in deleted
        .iter()
        .map(|path| Action::Delete { path: path.clone() })
        .chain(prunes)
    {
        if let Err(err) = engine.execute(&mut tx, action) {
            return Err(engine.abort(tx, AbortCause::Action(err)));
        }
    }

    let written = steps
        .iter()
        .filter(|step| !skipped.iter().any(|skip| skip.name == step.component))
        .filter_map(|step| {
            step.write
                .as_ref()
                .map(|(_, hash, _)| (step.target.clone(), hash.clone()))
        })
        .collect::<Vec<_>>();
    if let Err(err) = verify_written(layout, &written) {
        return Err(engine.abort(tx, AbortCause::Verification(err)));
    }

    let metadata = match build_metadata(layout, existing, manifest, &skipped, &steps, now) {
        Ok(metadata) => metadata,
        Err(err) => return Err(engine.abort(tx, AbortCause::Other(err))),
    };
    let report = engine.commit(tx, MetadataChange::Write(metadata))?;
    info!(
        txid = %report.txid,
        from = %result.from_version,
        to = %result.to_version,
        "update committed"
    );
    result.txid = Some(report.txid);
    result.metadata = report.metadata;
    fill_file_lists(&mut result, &steps, &skipped);
    result.skipped = skipped;
    Ok(result)
}

/// Merged text for a user-modified config, or `None` when merging changes nothing.
fn merged_content(
    layout: &TargetLayout,
    file: &ResolvedFile,
    mode: MergeMode,
) -> Result<Option<String>> {
    let target = layout.resolve(&file.target);
    let user = fs::read_to_string(&target)
        .with_context(|| format!("failed to read {}", target.display()))?;
    let incoming = fs::read_to_string(&file.source)
        .with_context(|| format!("failed to read {}", file.source.display()))?;
    let merged = merge_config_text(&user, &incoming, mode)?;
    if merged.trim_end() == user.trim_end() {
        return Ok(None);
    }
    Ok(Some(merged))
}

fn build_metadata(
    layout: &TargetLayout,
    existing: &InstallationMetadata,
    manifest: &Manifest,
    skipped: &[SkippedComponent],
    steps: &[Step],
    now: u64,
) -> Result<InstallationMetadata> {
    let is_skipped = |name: &str| skipped.iter().any(|skip| skip.name == name);
    let mut metadata = existing.clone();
    metadata.name = manifest.name.clone();
    metadata.version = manifest.version.clone();
    metadata.last_updated_at_unix = now;

    let mut components = BTreeMap::new();
    for component in &manifest.components {
        let state = if is_skipped(&component.name) {
            existing
                .components
                .get(&component.name)
                .cloned()
                .map(|mut state| {
                    state.enabled = false;
                    state
                })
                .unwrap_or(ComponentState {
                    version: manifest.version.clone(),
                    enabled: false,
                })
        } else {
            ComponentState {
                version: manifest.version.clone(),
                enabled: true,
            }
        };
        components.insert(component.name.clone(), state);
    }
    metadata.components = components;

    for step in steps {
        if is_skipped(&step.component) {
            continue;
        }
        match step.decision {
            FileDecision::Create
            | FileDecision::Update
            | FileDecision::Adopt
            | FileDecision::Unchanged => {
                metadata.upsert_record(record_from_disk(layout, &step.target, &step.component, false)?);
            }
            FileDecision::Merge => {
                metadata.upsert_record(record_from_disk(layout, &step.target, &step.component, true)?);
            }
            FileDecision::Preserve => {
                if let Some(record) = existing.record(&step.target) {
                    let mut record = record.clone();
                    record.user_modified = true;
                    metadata.upsert_record(record);
                }
            }
            FileDecision::Delete | FileDecision::Forget => {
                metadata.remove_record(&step.target);
            }
        }
    }
    metadata.sort_records();
    Ok(metadata)
}

/// Equal apart from timestamps and history.
fn same_tracking(candidate: &InstallationMetadata, existing: &InstallationMetadata) -> bool {
    candidate.name == existing.name
        && candidate.version == existing.version
        && candidate.components == existing.components
        && candidate.files.len() == existing.files.len()
        && candidate.files.iter().zip(&existing.files).all(|(left, right)| {
            left.path == right.path
                && left.content_hash == right.content_hash
                && left.component == right.component
                && left.user_modified == right.user_modified
        })
}

fn fill_file_lists(result: &mut UpdateResult, steps: &[Step], skipped: &[SkippedComponent]) {
    for step in steps {
        if skipped.iter().any(|skip| skip.name == step.component) {
            continue;
        }
        let list = match step.decision {
            FileDecision::Create => &mut result.created_files,
            FileDecision::Update => &mut result.updated_files,
            FileDecision::Merge => &mut result.merged_files,
            FileDecision::Preserve => &mut result.preserved_files,
            FileDecision::Delete | FileDecision::Forget => &mut result.deleted_files,
            FileDecision::Unchanged | FileDecision::Adopt => &mut result.unchanged_files,
        };
        list.push(step.target.clone());
    }
}
