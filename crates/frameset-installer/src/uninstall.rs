use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::action::Action;
use crate::engine::{MetadataChange, RecoveryReport, TransactionEngine};
use crate::error::{AbortCause, ActionErrorKind, EngineError, PreservationError};
use crate::metadata::{is_user_modified, DiskState};
use crate::plan::{is_safe_record, plan_backups, prune_directories};
use crate::{InstallationMetadata, Operation, TargetLayout};

/// Proof that the user confirmed a purge of one specific target root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeToken {
    root: PathBuf,
}

impl PurgeToken {
    /// The expected answer is the final component of the target root.
    pub fn expected_answer(layout: &TargetLayout) -> String {
        layout
            .root()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| layout.root().display().to_string())
    }

    pub fn confirm(layout: &TargetLayout, answer: &str) -> Result<Self, EngineError> {
        let expected = Self::expected_answer(layout);
        if answer.trim() != expected {
            return Err(EngineError::PurgeNotConfirmed { expected });
        }
        Ok(Self {
            root: layout.root().to_path_buf(),
        })
    }

    fn covers(&self, layout: &TargetLayout) -> bool {
        self.root == layout.root()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallOptions {
    pub preserve_customizations: bool,
    pub purge: Option<PurgeToken>,
    pub dry_run: bool,
}

impl Default for UninstallOptions {
    fn default() -> Self {
        Self {
            preserve_customizations: true,
            purge: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservedFile {
    pub original: PathBuf,
    pub backup: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallResult {
    pub txid: Option<String>,
    pub dry_run: bool,
    pub plan: Vec<Action>,
    pub removed_files: Vec<PathBuf>,
    /// User-modified files copied to the preservation directory before removal.
    pub preserved_files: Vec<PreservedFile>,
    /// User-modified files left in place.
    pub kept_files: Vec<PathBuf>,
    pub refused_paths: Vec<PathBuf>,
    pub preservation_path: Option<PathBuf>,
    pub recovered: Vec<RecoveryReport>,
}

pub fn uninstall(
    engine: &TransactionEngine,
    metadata: &InstallationMetadata,
    options: UninstallOptions,
) -> Result<UninstallResult, EngineError> {
    let layout = engine.layout();
    let purge = match &options.purge {
        Some(token) if token.covers(layout) => true,
        Some(_) => {
            return Err(EngineError::PurgeNotConfirmed {
                expected: PurgeToken::expected_answer(layout),
            });
        }
        None => false,
    };

    let mut result = UninstallResult {
        dry_run: options.dry_run,
        ..UninstallResult::default()
    };
    let mut to_delete = Vec::new();
    let mut to_preserve = Vec::new();
    for record in &metadata.files {
        if !is_safe_record(layout, &record.path) {
            warn!(path = %record.path.display(), "refusing to touch unsafe tracked path");
            result.refused_paths.push(record.path.clone());
            continue;
        }
        let disk = DiskState::read(layout, &record.path)?;
        match disk {
            DiskState::Missing => continue,
            DiskState::NotAFile => {
                warn!(path = %record.path.display(), "tracked path is no longer a file; leaving it");
                result.kept_files.push(record.path.clone());
                continue;
            }
            DiskState::File(_) => {}
        }

        if purge || !is_user_modified(record, &disk) {
            to_delete.push(record.path.clone());
        } else if options.preserve_customizations {
            to_preserve.push(record.path.clone());
            to_delete.push(record.path.clone());
        } else {
            result.kept_files.push(record.path.clone());
        }
    }

    let backup = plan_backups(layout, "uninstall", to_preserve.iter().map(PathBuf::as_path));
    let prunes = prune_directories(to_delete.iter().map(PathBuf::as_path));
    if let Some(backup) = &backup {
        result.preservation_path = Some(layout.resolve(&backup.dir));
        result.preserved_files = to_preserve
            .iter()
            .map(|path| PreservedFile {
                original: path.clone(),
                backup: layout.resolve(&backup.dir.join(path)),
            })
            .collect();
        result.plan.extend(backup.actions.iter().cloned());
    }
    result
        .plan
        .extend(to_delete.iter().map(|path| Action::Delete { path: path.clone() }));
    result.plan.extend(prunes.iter().cloned());

    if options.dry_run {
        for action in &result.plan {
            info!(action = %action, "would apply");
        }
        result.removed_files = to_delete;
        return Ok(result);
    }

    let mut tx = engine.begin(Operation::Uninstall)?;
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

    for action in to_delete
        .iter()
        .map(|path| Action::Delete { path: path.clone() })
        .chain(prunes)
    {
        if let Err(err) = engine.execute(&mut tx, action) {
            return Err(engine.abort(tx, AbortCause::Action(err)));
        }
    }

    let report = engine.commit(tx, MetadataChange::Remove)?;
    remove_state_dir(layout);
    info!(txid = %report.txid, removed = to_delete.len(), "uninstall committed");

    result.txid = Some(report.txid);
    result.removed_files = to_delete;
    Ok(result)
}

fn remove_state_dir(layout: &TargetLayout) {
    let state_dir = layout.state_dir();
    match fs::remove_dir_all(&state_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(dir = %state_dir.display(), error = %err, "failed to remove engine state directory");
        }
    }
}
