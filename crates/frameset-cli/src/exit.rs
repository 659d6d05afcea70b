use std::io;

use anyhow::Error;
use frameset_installer::{ActionErrorKind, EngineError};

pub(crate) const EXIT_GENERAL: u8 = 1;
pub(crate) const EXIT_PERMISSION_DENIED: u8 = 3;
pub(crate) const EXIT_MISSING_DEPENDENCY: u8 = 4;
pub(crate) const EXIT_CORRUPTED: u8 = 5;
pub(crate) const EXIT_CANCELLED: u8 = 10;
pub(crate) const EXIT_INSUFFICIENT_SPACE: u8 = 30;

/// Process exit status for a failed command.
pub(crate) fn exit_code_for(err: &Error) -> u8 {
    if let Some(engine) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
    {
        return engine_exit_code(engine);
    }
    if is_permission_denied(err) {
        EXIT_PERMISSION_DENIED
    } else {
        EXIT_GENERAL
    }
}

pub(crate) fn engine_exit_code(err: &EngineError) -> u8 {
    match err {
        EngineError::PermissionDenied { .. } => EXIT_PERMISSION_DENIED,
        EngineError::Action { error, .. } if error.kind == ActionErrorKind::PermissionDenied => {
            EXIT_PERMISSION_DENIED
        }
        EngineError::MissingDependency { .. } => EXIT_MISSING_DEPENDENCY,
        EngineError::Corrupted { .. } | EngineError::Verification { .. } => EXIT_CORRUPTED,
        EngineError::Cancelled { .. }
        | EngineError::Interrupted
        | EngineError::PurgeNotConfirmed { .. } => EXIT_CANCELLED,
        EngineError::InsufficientSpace { .. } => EXIT_INSUFFICIENT_SPACE,
        EngineError::Other(inner) if is_permission_denied(inner) => EXIT_PERMISSION_DENIED,
        _ => EXIT_GENERAL,
    }
}

fn is_permission_denied(err: &Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::PermissionDenied)
    })
}
