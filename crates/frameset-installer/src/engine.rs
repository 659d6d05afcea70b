//! Transaction engine.
//!
//! Every mutation of a target root goes through a [`Transaction`]:
//!
//! 1. the path's prior state is captured into the snapshot store,
//! 2. a `planned` record is appended to the journal and synced,
//! 3. the effect is performed,
//! 4. an `executed` (or `failed`) record is appended.
//!
//! Rollback walks the entries in reverse and applies the inverse derived
//! from each action and its snapshot. Installation metadata is written by
//! [`TransactionEngine::commit`] as the last journaled action, so a crash at
//! any point leaves either the previous metadata or the new one, and an
//! unfinished transaction is reversed by the next [`TransactionEngine::begin`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::action::{Action, ContentSource};
use crate::error::{
    AbortCause, ActionError, ActionErrorKind, CommitError, EngineError, RollbackError,
    RollbackReport, UnrestoredPath,
};
use crate::journal::{read_journal, replay, JournalRecord, LogEntry, TransactionLog};
use crate::lock::TargetLock;
use crate::snapshot::SnapshotStore;
use crate::transactions::{
    current_unix_timestamp, list_transactions, next_txid, process_alive, prune_transactions,
    update_transaction_status, write_transaction_metadata,
};
use crate::{
    EngineConfig, EntryStatus, InstallationMetadata, Operation, TargetLayout,
    TransactionMetadata, TransactionStatus, TransactionSummary,
};

const TRANSACTION_METADATA_VERSION: u32 = 1;

/// Hook run right before each effect; an error fails that action.
pub type BeforeEffect = Arc<dyn Fn(u64, &Action) -> Result<()> + Send + Sync>;

/// Cooperative cancellation flag checked before every action.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared flag, suitable for signal handler registration.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug)]
pub struct Transaction {
    id: String,
    operation: Operation,
    started_at_unix: u64,
    status: TransactionStatus,
    entries: Vec<LogEntry>,
    next_seq: u64,
    log: TransactionLog,
    snapshots: SnapshotStore,
    lock: TargetLock,
    recovered: Vec<RecoveryReport>,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn executed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == EntryStatus::Executed)
            .count()
    }

    /// Interrupted transactions that were rolled back when this one began.
    pub fn recovered(&self) -> &[RecoveryReport] {
        &self.recovered
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub txid: String,
    pub actions: usize,
    pub metadata: Option<InstallationMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub txid: String,
    pub operation: Operation,
    pub previous_status: TransactionStatus,
    pub reverted: usize,
    pub unrestored: Vec<UnrestoredPath>,
}

#[derive(Debug, Clone)]
pub enum MetadataChange {
    Write(InstallationMetadata),
    Remove,
}

pub struct TransactionEngine {
    layout: TargetLayout,
    config: EngineConfig,
    interrupt: Interrupt,
    before_effect: Option<BeforeEffect>,
}

impl TransactionEngine {
    pub fn new(layout: TargetLayout, config: EngineConfig) -> Self {
        Self {
            layout,
            config,
            interrupt: Interrupt::new(),
            before_effect: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_before_effect(mut self, hook: BeforeEffect) -> Self {
        self.before_effect = Some(hook);
        self
    }

    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Takes the target lock, rolls back any interrupted transaction and
    /// opens a new one.
    pub fn begin(&self, operation: Operation) -> Result<Transaction, EngineError> {
        self.layout.ensure_state_dirs()?;
        let started_at_unix = current_unix_timestamp()?;
        let txid = next_txid(started_at_unix);
        let lock = TargetLock::acquire(
            &self.layout,
            &txid,
            operation.as_str(),
            self.config.lock_stale_after,
        )?;

        let recovered = self.recover_abandoned()?;

        write_transaction_metadata(
            &self.layout,
            &TransactionMetadata {
                version: TRANSACTION_METADATA_VERSION,
                txid: txid.clone(),
                operation,
                status: TransactionStatus::Pending,
                pid: std::process::id(),
                started_at_unix,
                updated_at_unix: started_at_unix,
                unrestored: Vec::new(),
            },
        )?;
        let log = TransactionLog::create(&self.layout, &txid)?;
        let snapshots = SnapshotStore::create(&self.layout, &txid)?;

        info!(txid = %txid, operation = %operation, "transaction started");
        Ok(Transaction {
            id: txid,
            operation,
            started_at_unix,
            status: TransactionStatus::Pending,
            entries: Vec::new(),
            next_seq: 0,
            log,
            snapshots,
            lock,
            recovered,
        })
    }

    pub fn execute(&self, tx: &mut Transaction, action: Action) -> Result<(), ActionError> {
        self.execute_as(tx, None, action)
    }

    /// Executes one action attributed to `component`.
    pub fn execute_as(
        &self,
        tx: &mut Transaction,
        component: Option<&str>,
        action: Action,
    ) -> Result<(), ActionError> {
        let seq = self.stage(tx, component, &action)?;
        let outcome = self.perform(seq, &action);
        self.settle(tx, seq, component, &action, outcome)
    }

    /// Executes independent actions; with `parallel_copies` the effects run
    /// concurrently once every snapshot and `planned` record is durable.
    pub fn execute_batch(
        &self,
        tx: &mut Transaction,
        component: Option<&str>,
        actions: Vec<Action>,
    ) -> Result<(), ActionError> {
        if !self.config.parallel_copies || actions.len() < 2 {
            for action in actions {
                self.execute_as(tx, component, action)?;
            }
            return Ok(());
        }

        let mut staged = Vec::with_capacity(actions.len());
        for action in actions {
            let seq = self.stage(tx, component, &action)?;
            staged.push((seq, action));
        }

        let outcomes = staged
            .par_iter()
            .map(|(seq, action)| self.perform(*seq, action))
            .collect::<Vec<_>>();

        let mut first_error = None;
        for ((seq, action), outcome) in staged.iter().zip(outcomes) {
            if let Err(err) = self.settle(tx, *seq, component, action, outcome) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn checkpoint(&self, tx: &Transaction) -> Checkpoint {
        Checkpoint(tx.entries.len())
    }

    /// Reverts the actions executed after `checkpoint`; the transaction stays open.
    pub fn rollback_to(
        &self,
        tx: &mut Transaction,
        checkpoint: Checkpoint,
    ) -> Result<RollbackReport, RollbackError> {
        let start = checkpoint.0.min(tx.entries.len());
        let (reverted, unrestored) = revert_entries(
            &tx.id,
            &tx.snapshots,
            &mut tx.log,
            &mut tx.entries[start..],
        );
        if !unrestored.is_empty() {
            return Err(RollbackError {
                txid: tx.id.clone(),
                reverted,
                unrestored,
            });
        }
        debug!(txid = %tx.id, reverted, "rolled back to checkpoint");
        Ok(RollbackReport {
            txid: tx.id.clone(),
            reverted,
        })
    }

    pub fn rollback(&self, mut tx: Transaction) -> Result<RollbackReport, RollbackError> {
        tx.status = TransactionStatus::RollingBack;
        if let Err(err) =
            update_transaction_status(&self.layout, &tx.id, TransactionStatus::RollingBack, Vec::new())
        {
            warn!(txid = %tx.id, error = %format!("{err:#}"), "failed to record rollback start");
        }

        let (reverted, unrestored) =
            revert_entries(&tx.id, &tx.snapshots, &mut tx.log, &mut tx.entries);

        let status = if unrestored.is_empty() {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::Failed
        };
        let unrestored_paths = unrestored.iter().map(|item| item.path.clone()).collect();
        if let Err(err) = update_transaction_status(&self.layout, &tx.id, status, unrestored_paths) {
            warn!(txid = %tx.id, error = %format!("{err:#}"), "failed to record rollback result");
        }

        let Transaction {
            id, snapshots, lock, ..
        } = tx;
        if unrestored.is_empty() {
            if let Err(err) = snapshots.discard() {
                warn!(txid = %id, error = %format!("{err:#}"), "failed to discard snapshots");
            }
            self.prune_finished();
        }
        if let Err(err) = lock.release() {
            warn!(txid = %id, error = %format!("{err:#}"), "failed to release lock");
        }

        if unrestored.is_empty() {
            info!(txid = %id, reverted, "transaction rolled back");
            Ok(RollbackReport { txid: id, reverted })
        } else {
            error!(txid = %id, unrestored = unrestored.len(), "rollback incomplete");
            Err(RollbackError {
                txid: id,
                reverted,
                unrestored,
            })
        }
    }

    /// Rolls `tx` back and turns `cause` into the error the caller reports.
    pub fn abort(&self, tx: Transaction, cause: AbortCause) -> EngineError {
        match self.rollback(tx) {
            Ok(report) => EngineError::from_abort(cause, report),
            Err(rollback) => EngineError::Rollback {
                failure: cause.to_string(),
                rollback,
            },
        }
    }

    /// Persists `change` as the final action and marks the transaction committed.
    pub fn commit(
        &self,
        mut tx: Transaction,
        change: MetadataChange,
    ) -> Result<CommitReport, EngineError> {
        if let Some(entry) = tx
            .entries
            .iter()
            .find(|entry| !matches!(entry.status, EntryStatus::Executed | EntryStatus::Reverted))
        {
            let reason = format!(
                "action #{} ({}) did not complete",
                entry.seq, entry.action
            );
            return Err(self.fail_commit(tx, reason));
        }

        let finished_at_unix = current_unix_timestamp().unwrap_or(tx.started_at_unix);
        let actions = tx.executed_count();
        let metadata_path = self.layout.metadata_rel_path();
        let (action, metadata) = match change {
            MetadataChange::Write(mut metadata) => {
                metadata.transaction_history.push(TransactionSummary {
                    txid: tx.id.clone(),
                    operation: tx.operation,
                    status: TransactionStatus::Committed,
                    started_at_unix: tx.started_at_unix,
                    finished_at_unix,
                    actions,
                });
                let overflow = metadata
                    .transaction_history
                    .len()
                    .saturating_sub(self.config.history_limit);
                metadata.transaction_history.drain(..overflow);

                let text = match serde_json::to_string_pretty(&metadata) {
                    Ok(text) => text + "\n",
                    Err(err) => {
                        return Err(self.fail_commit(tx, format!("failed to serialize metadata: {err}")));
                    }
                };
                let content = ContentSource::Inline { text };
                let action = if self.layout.metadata_path().exists() {
                    Action::Update {
                        path: metadata_path,
                        content,
                        mode: None,
                    }
                } else {
                    Action::Create {
                        path: metadata_path,
                        content,
                        mode: None,
                    }
                };
                (action, Some(metadata))
            }
            MetadataChange::Remove => (
                Action::Delete {
                    path: metadata_path,
                },
                None,
            ),
        };

        if let Err(err) = self.execute(&mut tx, action) {
            return Err(self.fail_commit(tx, err.to_string()));
        }
        if let Err(err) =
            update_transaction_status(&self.layout, &tx.id, TransactionStatus::Committed, Vec::new())
        {
            return Err(self.fail_commit(tx, format!("{err:#}")));
        }

        let Transaction {
            id, snapshots, lock, ..
        } = tx;
        if let Err(err) = snapshots.discard() {
            warn!(txid = %id, error = %format!("{err:#}"), "failed to discard snapshots");
        }
        self.prune_finished();
        if let Err(err) = lock.release() {
            warn!(txid = %id, error = %format!("{err:#}"), "failed to release lock");
        }

        info!(txid = %id, actions, "transaction committed");
        Ok(CommitReport {
            txid: id,
            actions,
            metadata,
        })
    }

    /// Rolls back interrupted transactions under the target lock.
    pub fn recover(&self) -> Result<Vec<RecoveryReport>, EngineError> {
        if !self.layout.state_dir().exists() {
            return Ok(Vec::new());
        }
        let txid = next_txid(current_unix_timestamp()?);
        let lock = TargetLock::acquire(
            &self.layout,
            &txid,
            Operation::Recover.as_str(),
            self.config.lock_stale_after,
        )?;
        let reports = self.recover_abandoned()?;
        self.prune_finished();
        lock.release()?;
        Ok(reports)
    }

    /// Caller must hold the target lock.
    fn prune_finished(&self) {
        match prune_transactions(&self.layout, self.config.history_limit) {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "pruned finished transactions"),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to prune finished transactions");
            }
        }
    }

    fn fail_commit(&self, tx: Transaction, reason: String) -> EngineError {
        let txid = tx.id.clone();
        warn!(txid = %txid, reason = %reason, "commit failed, rolling back");
        match self.rollback(tx) {
            Ok(rollback) => CommitError {
                txid,
                reason,
                rollback,
            }
            .into(),
            Err(rollback) => EngineError::Rollback {
                failure: format!("commit of transaction {txid} failed: {reason}"),
                rollback,
            },
        }
    }

    /// Caller must hold the target lock. Transactions owned by this process
    /// cannot be live while the lock is held here.
    fn recover_abandoned(&self) -> Result<Vec<RecoveryReport>> {
        let mut reports = Vec::new();
        for metadata in list_transactions(&self.layout)? {
            if !metadata.status.needs_recovery() {
                continue;
            }
            if metadata.pid != std::process::id() && process_alive(metadata.pid) {
                warn!(
                    txid = %metadata.txid,
                    pid = metadata.pid,
                    "interrupted transaction still has a live owner; leaving it"
                );
                continue;
            }
            warn!(
                txid = %metadata.txid,
                status = %metadata.status,
                "resuming rollback of interrupted transaction"
            );
            reports.push(self.resume_rollback(&metadata)?);
        }
        Ok(reports)
    }

    fn resume_rollback(&self, metadata: &TransactionMetadata) -> Result<RecoveryReport> {
        let txid = metadata.txid.as_str();
        update_transaction_status(
            &self.layout,
            txid,
            TransactionStatus::RollingBack,
            metadata.unrestored.clone(),
        )?;

        let mut entries = replay(&read_journal(&self.layout, txid)?);
        let snapshots = SnapshotStore::open(&self.layout, txid)?;
        let mut log = TransactionLog::open_append(&self.layout, txid)?;
        let (reverted, unrestored) = revert_entries(txid, &snapshots, &mut log, &mut entries);

        // a transaction that already failed one rollback is not retried again
        let status = if unrestored.is_empty() || metadata.status == TransactionStatus::Failed {
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::Failed
        };
        update_transaction_status(
            &self.layout,
            txid,
            status,
            unrestored.iter().map(|item| item.path.clone()).collect(),
        )?;

        if unrestored.is_empty() {
            if let Err(err) = snapshots.discard() {
                warn!(txid, error = %format!("{err:#}"), "failed to discard snapshots");
            }
            info!(txid, reverted, "interrupted transaction rolled back");
        } else {
            error!(
                txid,
                unrestored = unrestored.len(),
                staging = %self.layout.transaction_staging_path(txid).display(),
                "interrupted transaction could not be fully restored"
            );
        }

        Ok(RecoveryReport {
            txid: metadata.txid.clone(),
            operation: metadata.operation,
            previous_status: metadata.status,
            reverted,
            unrestored,
        })
    }

    fn stage(
        &self,
        tx: &mut Transaction,
        component: Option<&str>,
        action: &Action,
    ) -> Result<u64, ActionError> {
        if self.interrupt.is_requested() {
            return Err(action_error(
                tx,
                None,
                component,
                action,
                ActionErrorKind::Cancelled,
                "interrupted".to_string(),
            ));
        }
        if let Err(err) = action.check_paths(self.layout.root()) {
            return Err(action_error(
                tx,
                None,
                component,
                action,
                ActionErrorKind::UnsafePath,
                format!("{err:#}"),
            ));
        }
        let captured = tx.snapshots.capture(action.path()).map(|_| ());
        if let Err(err) = captured {
            return Err(action_error(
                tx,
                None,
                component,
                action,
                ActionErrorKind::Snapshot,
                format!("{err:#}"),
            ));
        }

        let seq = tx.next_seq;
        tx.next_seq += 1;
        let record = JournalRecord::Planned {
            seq,
            component: component.map(str::to_string),
            action: action.clone(),
        };
        if let Err(err) = tx.log.append(&record) {
            return Err(action_error(
                tx,
                Some(seq),
                component,
                action,
                ActionErrorKind::Journal,
                format!("{err:#}"),
            ));
        }
        tx.entries.push(LogEntry {
            seq,
            component: component.map(str::to_string),
            action: action.clone(),
            status: EntryStatus::Planned,
        });
        Ok(seq)
    }

    fn perform(&self, seq: u64, action: &Action) -> Result<()> {
        if let Some(hook) = &self.before_effect {
            hook(seq, action)?;
        }
        action.apply(self.layout.root())
    }

    fn settle(
        &self,
        tx: &mut Transaction,
        seq: u64,
        component: Option<&str>,
        action: &Action,
        outcome: Result<()>,
    ) -> Result<(), ActionError> {
        match outcome {
            Ok(()) => {
                if let Err(err) = tx.log.append(&JournalRecord::Executed { seq }) {
                    return Err(action_error(
                        tx,
                        Some(seq),
                        component,
                        action,
                        ActionErrorKind::Journal,
                        format!("{err:#}"),
                    ));
                }
                set_entry_status(&mut tx.entries, seq, EntryStatus::Executed);
                debug!(txid = %tx.id, seq, action = %action, "action executed");
                Ok(())
            }
            Err(err) => {
                let reason = format!("{err:#}");
                let record = JournalRecord::Failed {
                    seq,
                    reason: reason.clone(),
                };
                if let Err(log_err) = tx.log.append(&record) {
                    warn!(txid = %tx.id, seq, error = %format!("{log_err:#}"), "failed to journal action failure");
                }
                set_entry_status(&mut tx.entries, seq, EntryStatus::Failed);
                warn!(txid = %tx.id, seq, action = %action, error = %reason, "action failed");
                let kind = if is_permission_denied(&err) {
                    ActionErrorKind::PermissionDenied
                } else {
                    ActionErrorKind::Effect
                };
                Err(action_error(tx, Some(seq), component, action, kind, reason))
            }
        }
    }
}

fn action_error(
    tx: &Transaction,
    seq: Option<u64>,
    component: Option<&str>,
    action: &Action,
    kind: ActionErrorKind,
    reason: String,
) -> ActionError {
    ActionError {
        txid: tx.id.clone(),
        seq,
        action: action.to_string(),
        path: action.path().to_path_buf(),
        component: component.map(str::to_string),
        kind,
        reason,
    }
}

fn set_entry_status(entries: &mut [LogEntry], seq: u64, status: EntryStatus) {
    if let Some(entry) = entries.iter_mut().rev().find(|entry| entry.seq == seq) {
        entry.status = status;
    }
}

fn is_permission_denied(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::PermissionDenied)
    })
}

/// Reverts `entries` newest first, skipping those already reverted.
fn revert_entries(
    txid: &str,
    snapshots: &SnapshotStore,
    log: &mut TransactionLog,
    entries: &mut [LogEntry],
) -> (usize, Vec<UnrestoredPath>) {
    let mut reverted = 0;
    let mut unrestored = Vec::new();
    for entry in entries.iter_mut().rev() {
        if entry.status == EntryStatus::Reverted {
            continue;
        }
        let path = entry.action.path().to_path_buf();
        let result = match snapshots.get(&path) {
            Some(snapshot) => {
                let inverse = entry.action.inverse(&snapshot.prior);
                snapshots.apply_inverse(&path, &inverse)
            }
            None => Err(anyhow!("no snapshot recorded for {}", path.display())),
        };

        match result {
            Ok(()) => {
                if let Err(err) = log.append(&JournalRecord::Reverted { seq: entry.seq }) {
                    warn!(txid, seq = entry.seq, error = %format!("{err:#}"), "failed to journal revert");
                }
                entry.status = EntryStatus::Reverted;
                reverted += 1;
                debug!(txid, seq = entry.seq, action = %entry.action, "action reverted");
            }
            Err(err) => {
                let reason = format!("{err:#}");
                let record = JournalRecord::RevertFailed {
                    seq: entry.seq,
                    reason: reason.clone(),
                };
                if let Err(log_err) = log.append(&record) {
                    warn!(txid, seq = entry.seq, error = %format!("{log_err:#}"), "failed to journal revert failure");
                }
                error!(txid, path = %path.display(), error = %reason, "failed to restore path");
                unrestored.push(UnrestoredPath {
                    path,
                    reason,
                });
            }
        }
    }
    (reverted, unrestored)
}
