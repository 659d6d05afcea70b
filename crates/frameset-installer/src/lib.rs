mod action;
mod engine;
mod error;
mod fs_utils;
mod install;
mod journal;
mod layout;
mod lock;
mod merge;
mod metadata;
mod plan;
mod probe;
mod snapshot;
mod transactions;
mod types;
mod uninstall;
mod update;
mod verify;

pub use action::{Action, ContentSource, Inverse};
pub use engine::{
    BeforeEffect, Checkpoint, CommitReport, Interrupt, MetadataChange, RecoveryReport,
    Transaction, TransactionEngine,
};
pub use error::{
    AbortCause, ActionError, ActionErrorKind, CommitError, EngineError, LockHeldError,
    PreservationError, RollbackError, RollbackReport, UnrestoredPath, VerificationError,
};
pub use install::{install, InstallOptions, InstallResult};
pub use journal::{read_journal, JournalRecord, LogEntry};
pub use layout::{default_target_root, TargetLayout, BACKUPS_DIR_NAME, STATE_DIR_NAME};
pub use lock::{read_lock, LockMetadata, TargetLock};
pub use merge::{merge_config_text, merge_json, MergeMode};
pub use metadata::{read_metadata, require_metadata, DiskState};
pub use plan::SkippedComponent;
pub use probe::{probe_environment, probe_environment_with_timeout, EnvironmentReport};
pub use snapshot::PriorState;
pub use transactions::{list_transactions, read_transaction_metadata};
pub use types::{
    ComponentState, EngineConfig, EntryStatus, InstallationMetadata, InstalledFileRecord,
    Operation, TransactionMetadata, TransactionStatus, TransactionSummary,
    METADATA_SCHEMA_VERSION,
};
pub use uninstall::{uninstall, PreservedFile, PurgeToken, UninstallOptions, UninstallResult};
pub use update::{update, FileDecision, UpdateOptions, UpdateResult};
pub use verify::{verify_installation, VerifyReport};

#[cfg(test)]
mod tests;
