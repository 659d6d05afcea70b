use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::{TargetLayout, TransactionMetadata, TransactionStatus};

static TXID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next_txid(started_at_unix: u64) -> String {
    let counter = TXID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tx-{started_at_unix}-{}-{counter}", std::process::id())
}

pub fn write_transaction_metadata(
    layout: &TargetLayout,
    metadata: &TransactionMetadata,
) -> Result<PathBuf> {
    let path = layout.transaction_metadata_path(&metadata.txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut raw = serde_json::to_string_pretty(metadata)
        .context("failed to serialize transaction metadata")?;
    raw.push('\n');
    write_atomic(&path, raw.as_bytes(), None).with_context(|| {
        format!(
            "failed to write transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(path)
}

pub fn read_transaction_metadata(
    layout: &TargetLayout,
    txid: &str,
) -> Result<Option<TransactionMetadata>> {
    let path = layout.transaction_metadata_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to read transaction metadata file: {}",
                    path.display()
                )
            });
        }
    };

    let metadata = serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed parsing transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(Some(metadata))
}

pub fn update_transaction_status(
    layout: &TargetLayout,
    txid: &str,
    status: TransactionStatus,
    unrestored: Vec<PathBuf>,
) -> Result<()> {
    let mut metadata = read_transaction_metadata(layout, txid)?
        .ok_or_else(|| anyhow!("transaction metadata not found for '{txid}'"))?;
    metadata.status = status;
    metadata.unrestored = unrestored;
    metadata.updated_at_unix = current_unix_timestamp()?;
    write_transaction_metadata(layout, &metadata)?;
    Ok(())
}

/// All transaction metadata files of the target, oldest first.
pub fn list_transactions(layout: &TargetLayout) -> Result<Vec<TransactionMetadata>> {
    let dir = layout.transactions_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut transactions = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(txid) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some(metadata) = read_transaction_metadata(layout, txid)? {
            transactions.push(metadata);
        }
    }
    transactions.sort_by(|left, right| {
        left.started_at_unix
            .cmp(&right.started_at_unix)
            .then_with(|| txid_sequence(&left.txid).cmp(&txid_sequence(&right.txid)))
            .then_with(|| left.txid.cmp(&right.txid))
    });
    Ok(transactions)
}

/// The per-process counter at the end of a txid, ordering ids minted in the same second.
fn txid_sequence(txid: &str) -> u64 {
    txid.rsplit('-')
        .next()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Deletes the files of finished transactions beyond the newest `keep`.
/// Transactions that left paths unrestored are kept with their staging data.
pub fn prune_transactions(layout: &TargetLayout, keep: usize) -> Result<usize> {
    let finished = list_transactions(layout)?
        .into_iter()
        .filter(|metadata| {
            matches!(
                metadata.status,
                TransactionStatus::Committed | TransactionStatus::RolledBack
            ) && metadata.unrestored.is_empty()
        })
        .collect::<Vec<_>>();
    let overflow = finished.len().saturating_sub(keep);
    for metadata in &finished[..overflow] {
        remove_transaction_files(layout, &metadata.txid)?;
    }
    Ok(overflow)
}

// metadata goes last so an interrupted prune is retried on the next pass
fn remove_transaction_files(layout: &TargetLayout, txid: &str) -> Result<()> {
    let journal = layout.transaction_journal_path(txid);
    remove_file_if_exists(&journal)
        .with_context(|| format!("failed to remove {}", journal.display()))?;
    let staging = layout.transaction_staging_path(txid);
    match fs::remove_dir_all(&staging) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to remove {}", staging.display()));
        }
    }
    let metadata = layout.transaction_metadata_path(txid);
    remove_file_if_exists(&metadata)
        .with_context(|| format!("failed to remove {}", metadata.display()))
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

/// Whether `pid` names a running process. Zombies count as gone.
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}
