use std::path::{Path, PathBuf};

use frameset_core::{ContentHash, Manifest};
use tracing::{info, warn};

use crate::action::{Action, ContentSource};
use crate::engine::{MetadataChange, RecoveryReport, TransactionEngine};
use crate::error::{AbortCause, ActionErrorKind, EngineError};
use crate::metadata::{record_from_disk, DiskState};
use crate::plan::{missing_directories, resolve_components, SkippedComponent};
use crate::probe::EnvironmentReport;
use crate::transactions::current_unix_timestamp;
use crate::verify::verify_written;
use crate::{ComponentState, InstallationMetadata, Operation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub dry_run: bool,
    /// Overwrite files that differ from the framework copy.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallResult {
    /// `None` for dry runs and for installs with nothing to do.
    pub txid: Option<String>,
    pub dry_run: bool,
    pub plan: Vec<Action>,
    pub installed_files: Vec<PathBuf>,
    pub already_present: Vec<PathBuf>,
    /// Existing files that differ and were left untouched.
    pub conflicts: Vec<PathBuf>,
    pub skipped: Vec<SkippedComponent>,
    pub metadata: Option<InstallationMetadata>,
    pub recovered: Vec<RecoveryReport>,
}

struct PlannedWrite {
    target: PathBuf,
    hash: ContentHash,
    action: Action,
}

struct ComponentPlan {
    name: String,
    required: bool,
    targets: Vec<PathBuf>,
    writes: Vec<PlannedWrite>,
}

pub fn install(
    engine: &TransactionEngine,
    manifest: &Manifest,
    source_root: &Path,
    environment: &EnvironmentReport,
    options: InstallOptions,
) -> Result<InstallResult, EngineError> {
    environment.preflight(manifest.min_free_bytes)?;
    let layout = engine.layout();
    let existing = environment.existing_installation.as_ref();
    let resolution = resolve_components(manifest, source_root, layout)?;

    let mut result = InstallResult {
        dry_run: options.dry_run,
        skipped: resolution.skipped.clone(),
        ..InstallResult::default()
    };

    let mut components = Vec::new();
    for component in &resolution.components {
        let mut plan = ComponentPlan {
            name: component.name.clone(),
            required: component.required,
            targets: Vec::new(),
            writes: Vec::new(),
        };
        for file in &component.files {
            let content = ContentSource::Copy {
                from: file.source.clone(),
            };
            let action = match DiskState::read(layout, &file.target)? {
                DiskState::Missing => Action::Create {
                    path: file.target.clone(),
                    content,
                    mode: file.mode,
                },
                DiskState::File(hash) if hash == file.hash => {
                    result.already_present.push(file.target.clone());
                    plan.targets.push(file.target.clone());
                    continue;
                }
                _ if options.force => Action::Update {
                    path: file.target.clone(),
                    content,
                    mode: file.mode,
                },
                _ => {
                    warn!(path = %file.target.display(), "existing file differs; leaving it in place");
                    result.conflicts.push(file.target.clone());
                    continue;
                }
            };
            plan.targets.push(file.target.clone());
            plan.writes.push(PlannedWrite {
                target: file.target.clone(),
                hash: file.hash.clone(),
                action,
            });
        }
        components.push(plan);
    }

    let directories = missing_directories(
        layout,
        components
            .iter()
            .flat_map(|plan| plan.writes.iter().map(|write| write.target.as_path())),
    );
    result.plan = directories
        .iter()
        .map(|path| Action::CreateDirectory { path: path.clone() })
        .chain(
            components
                .iter()
                .flat_map(|plan| plan.writes.iter().map(|write| write.action.clone())),
        )
        .collect();

    let fully_recorded = existing.is_some_and(|metadata| {
        metadata.version == manifest.version
            && components
                .iter()
                .flat_map(|plan| plan.targets.iter())
                .all(|target| metadata.record(target).is_some())
    });
    if options.dry_run {
        for action in &result.plan {
            info!(action = %action, "would apply");
        }
        return Ok(result);
    }
    if result.plan.is_empty() && fully_recorded {
        info!("installation is already up to date");
        return Ok(result);
    }

    let now = current_unix_timestamp()?;
    let mut tx = engine.begin(Operation::Install)?;
    result.recovered = tx.recovered().to_vec();

    for path in directories {
        if let Err(err) = engine.execute(&mut tx, Action::CreateDirectory { path }) {
            return Err(engine.abort(tx, AbortCause::Action(err)));
        }
    }

    let mut installed = Vec::new();
    for plan in components {
        let checkpoint = engine.checkpoint(&tx);
        let actions = plan.writes.iter().map(|write| write.action.clone()).collect();
        match engine.execute_batch(&mut tx, Some(&plan.name), actions) {
            Ok(()) => installed.push(plan),
            Err(err) if plan.required || err.kind == ActionErrorKind::Cancelled => {
                return Err(engine.abort(tx, AbortCause::Action(err)));
            }
            Err(err) => {
                warn!(component = %plan.name, error = %err, "optional component failed; undoing its changes");
                if let Err(rollback) = engine.rollback_to(&mut tx, checkpoint) {
                    warn!(component = %plan.name, error = %rollback, "could not undo optional component");
                    return Err(engine.abort(tx, AbortCause::Action(err)));
                }
                result.skipped.push(SkippedComponent {
                    name: plan.name.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    let written = installed
        .iter()
        .flat_map(|plan| plan.writes.iter().map(|write| (write.target.clone(), write.hash.clone())))
        .collect::<Vec<_>>();
    if let Err(err) = verify_written(layout, &written) {
        return Err(engine.abort(tx, AbortCause::Verification(err)));
    }

    let mut metadata = match existing {
        Some(existing) => existing.clone(),
        None => InstallationMetadata::new(manifest, now),
    };
    metadata.name = manifest.name.clone();
    metadata.version = manifest.version.clone();
    metadata.last_updated_at_unix = now;
    for plan in &installed {
        metadata.components.insert(
            plan.name.clone(),
            ComponentState {
                version: manifest.version.clone(),
                enabled: true,
            },
        );
        for target in &plan.targets {
            match record_from_disk(layout, target, &plan.name, false) {
                Ok(record) => metadata.upsert_record(record),
                Err(err) => return Err(engine.abort(tx, AbortCause::Other(err))),
            }
        }
    }
    for skipped in &result.skipped {
        metadata
            .components
            .entry(skipped.name.clone())
            .or_insert_with(|| ComponentState {
                version: manifest.version.clone(),
                enabled: false,
            });
    }

    let report = engine.commit(tx, MetadataChange::Write(metadata))?;
    result.txid = Some(report.txid);
    result.installed_files = written.into_iter().map(|(path, _)| path).collect();
    result.metadata = report.metadata;
    Ok(result)
}
