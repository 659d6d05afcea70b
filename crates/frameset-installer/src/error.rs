use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionErrorKind {
    /// The pre-mutation snapshot could not be captured.
    Snapshot,
    /// The journal record could not be made durable.
    Journal,
    /// The filesystem effect itself failed.
    Effect,
    PermissionDenied,
    UnsafePath,
    Cancelled,
}

#[derive(Debug, Clone, Error)]
#[error("transaction {txid}: {action} failed: {reason}")]
pub struct ActionError {
    pub txid: String,
    pub seq: Option<u64>,
    pub action: String,
    pub path: PathBuf,
    pub component: Option<String>,
    pub kind: ActionErrorKind,
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
#[error("{} is locked by pid {pid} ({operation}, transaction {txid}) since {acquired_at_unix}", lock_path.display())]
pub struct LockHeldError {
    pub lock_path: PathBuf,
    pub pid: u32,
    pub txid: String,
    pub operation: String,
    pub acquired_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrestoredPath {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for UnrestoredPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub txid: String,
    pub reverted: usize,
}

#[derive(Debug, Clone, Error)]
#[error("rollback of transaction {txid} left {} path(s) unrestored", unrestored.len())]
pub struct RollbackError {
    pub txid: String,
    pub reverted: usize,
    pub unrestored: Vec<UnrestoredPath>,
}

#[derive(Debug, Clone, Error)]
#[error("transaction {txid} could not be committed: {reason}")]
pub struct CommitError {
    pub txid: String,
    pub reason: String,
    pub rollback: RollbackReport,
}

#[derive(Debug, Clone, Error)]
#[error("could not preserve {} into {}: {reason}", path.display(), backup.display())]
pub struct PreservationError {
    pub txid: String,
    pub path: PathBuf,
    pub backup: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("integrity check failed: {} missing, {} mismatched", missing.len(), mismatched.len())]
pub struct VerificationError {
    pub missing: Vec<PathBuf>,
    pub mismatched: Vec<PathBuf>,
}

/// Failure that makes an open transaction unusable; the engine rolls the
/// transaction back before surfacing it as an [`EngineError`].
#[derive(Debug, Error)]
pub enum AbortCause {
    #[error(transparent)]
    Action(ActionError),
    #[error(transparent)]
    Preservation(PreservationError),
    #[error(transparent)]
    Verification(VerificationError),
    #[error(transparent)]
    Other(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    LockHeld(#[from] LockHeldError),
    #[error("{error}; rolled back {} action(s)", rollback.reverted)]
    Action {
        error: ActionError,
        rollback: RollbackReport,
    },
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("{failure}; {rollback}")]
    Rollback {
        failure: String,
        #[source]
        rollback: RollbackError,
    },
    #[error("{error}")]
    Verification {
        error: VerificationError,
        rollback: Option<RollbackReport>,
    },
    #[error("{error}; rolled back {} action(s)", rollback.reverted)]
    Preservation {
        error: PreservationError,
        rollback: RollbackReport,
    },
    #[error("transaction {txid} cancelled; rolled back {} action(s)", rollback.reverted)]
    Cancelled {
        txid: String,
        rollback: RollbackReport,
    },
    #[error("interrupted before any change was made")]
    Interrupted,
    #[error("target is not writable: {}", root.display())]
    PermissionDenied { root: PathBuf },
    #[error("insufficient disk space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("required component '{component}' is unavailable: {reason}")]
    MissingDependency { component: String, reason: String },
    #[error("installation metadata is corrupted at {}: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },
    #[error("no installation found at {}", root.display())]
    NotInstalled { root: PathBuf },
    #[error("purge was not confirmed; type '{expected}' to confirm")]
    PurgeNotConfirmed { expected: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn from_abort(cause: AbortCause, rollback: RollbackReport) -> Self {
        match cause {
            AbortCause::Action(error) if error.kind == ActionErrorKind::Cancelled => {
                Self::Cancelled {
                    txid: error.txid,
                    rollback,
                }
            }
            AbortCause::Action(error) => Self::Action { error, rollback },
            AbortCause::Preservation(error) => Self::Preservation { error, rollback },
            AbortCause::Verification(error) => Self::Verification {
                error,
                rollback: Some(rollback),
            },
            AbortCause::Other(error) => Self::Other(error.context(format!(
                "transaction {} rolled back {} action(s)",
                rollback.txid, rollback.reverted
            ))),
        }
    }

    /// One line on what the user can do next.
    pub fn remediation(&self) -> String {
        match self {
            Self::LockHeld(err) => format!(
                "wait for pid {} to finish, or remove {} if that process no longer exists",
                err.pid,
                err.lock_path.display()
            ),
            Self::Action { error, .. } => match error.kind {
                ActionErrorKind::PermissionDenied => format!(
                    "check write permissions on {}",
                    error.path.display()
                ),
                _ => "no changes were kept; fix the reported problem and run again".to_string(),
            },
            Self::Commit(_) => {
                "the installation was restored to its previous state; run again".to_string()
            }
            Self::Rollback { rollback, .. } => format!(
                "restore {} from the transaction staging directory or run `frameset recover`",
                rollback
                    .unrestored
                    .iter()
                    .map(|item| item.path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::Verification { .. } => {
                "reinstall with --force to restore the framework files".to_string()
            }
            Self::Preservation { error, .. } => format!(
                "free space or fix permissions for {}; nothing was deleted",
                error.backup.display()
            ),
            Self::Cancelled { .. } => "run the command again to resume".to_string(),
            Self::Interrupted => "run the command again".to_string(),
            Self::PermissionDenied { root } => {
                format!("choose a writable --target or fix permissions on {}", root.display())
            }
            Self::InsufficientSpace { required, .. } => {
                format!("free at least {required} bytes on the target volume")
            }
            Self::MissingDependency { component, .. } => {
                format!("provide the source files for component '{component}'")
            }
            Self::Corrupted { path, .. } => format!(
                "move {} aside and reinstall with --force",
                path.display()
            ),
            Self::NotInstalled { .. } => "run `frameset install` first".to_string(),
            Self::PurgeNotConfirmed { expected } => {
                format!("re-run and answer '{expected}' to confirm the purge")
            }
            Self::Other(_) => "re-run with --verbose for details".to_string(),
        }
    }
}
