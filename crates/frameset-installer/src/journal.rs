use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::action::Action;
use crate::{EntryStatus, TargetLayout};

/// One line of a transaction journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalRecord {
    Planned {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        component: Option<String>,
        action: Action,
    },
    Executed {
        seq: u64,
    },
    Failed {
        seq: u64,
        reason: String,
    },
    Reverted {
        seq: u64,
    },
    RevertFailed {
        seq: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub seq: u64,
    pub component: Option<String>,
    pub action: Action,
    pub status: EntryStatus,
}

/// Append-only, fsync-per-record journal of a single transaction.
#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    file: File,
}

impl TransactionLog {
    pub fn create(layout: &TargetLayout, txid: &str) -> Result<Self> {
        let path = layout.transaction_journal_path(txid);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("failed to create transaction journal: {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn open_append(layout: &TargetLayout, txid: &str) -> Result<Self> {
        let path = layout.transaction_journal_path(txid);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open transaction journal: {}", path.display()))?;
        drop_torn_tail(&mut file, &path)?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("failed to serialize journal record")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to append transaction journal: {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("failed to sync transaction journal: {}", self.path.display()))
    }
}

/// Cuts a partially written last record so new records start on their own line.
fn drop_torn_tail(file: &mut File, path: &Path) -> Result<()> {
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)
        .with_context(|| format!("failed to read transaction journal: {}", path.display()))?;
    if raw.is_empty() || raw.ends_with(b"\n") {
        return Ok(());
    }
    let keep = raw
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |index| index + 1);
    warn!(journal = %path.display(), "dropping torn journal record");
    file.set_len(keep as u64)
        .and_then(|()| file.sync_data())
        .with_context(|| format!("failed to truncate transaction journal: {}", path.display()))
}

pub fn read_journal(layout: &TargetLayout, txid: &str) -> Result<Vec<JournalRecord>> {
    let path = layout.transaction_journal_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read transaction journal: {}", path.display()));
        }
    };

    let lines = raw.lines().filter(|line| !line.trim().is_empty()).collect::<Vec<_>>();
    let mut records = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(_) if index + 1 == lines.len() => {
                warn!(journal = %path.display(), "ignoring torn journal record");
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "corrupted transaction journal {} at line {}",
                        path.display(),
                        index + 1
                    )
                });
            }
        }
    }
    Ok(records)
}

/// Folds journal records into per-action entries ordered by sequence number.
pub fn replay(records: &[JournalRecord]) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = Vec::new();
    for record in records {
        match record {
            JournalRecord::Planned {
                seq,
                component,
                action,
            } => entries.push(LogEntry {
                seq: *seq,
                component: component.clone(),
                action: action.clone(),
                status: EntryStatus::Planned,
            }),
            JournalRecord::Executed { seq } => set_status(&mut entries, *seq, EntryStatus::Executed),
            JournalRecord::Failed { seq, .. } => set_status(&mut entries, *seq, EntryStatus::Failed),
            JournalRecord::Reverted { seq } => set_status(&mut entries, *seq, EntryStatus::Reverted),
            // still owes a revert
            JournalRecord::RevertFailed { .. } => {}
        }
    }
    entries.sort_by_key(|entry| entry.seq);
    entries
}

fn set_status(entries: &mut [LogEntry], seq: u64, status: EntryStatus) {
    if let Some(entry) = entries.iter_mut().rev().find(|entry| entry.seq == seq) {
        entry.status = status;
    }
}
