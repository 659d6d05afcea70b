use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use frameset_core::{ContentHash, Manifest};
use semver::Version;
use serde::{Deserialize, Serialize};

pub const METADATA_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Install,
    Update,
    Uninstall,
    Recover,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Uninstall => "uninstall",
            Self::Recover => "recover",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    RollingBack,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RollingBack => "rolling_back",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    /// Transactions left in these states were interrupted and still own
    /// effects on disk that must be reversed.
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Pending | Self::RollingBack | Self::Failed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Planned,
    Executed,
    Failed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub version: u32,
    pub txid: String,
    pub operation: Operation,
    pub status: TransactionStatus,
    pub pid: u32,
    pub started_at_unix: u64,
    pub updated_at_unix: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unrestored: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub txid: String,
    pub operation: Operation,
    pub status: TransactionStatus,
    pub started_at_unix: u64,
    pub finished_at_unix: u64,
    pub actions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentState {
    pub version: Version,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledFileRecord {
    pub path: PathBuf,
    pub content_hash: ContentHash,
    pub size: u64,
    pub mtime_unix: u64,
    pub component: String,
    #[serde(default)]
    pub user_modified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationMetadata {
    pub schema_version: u32,
    pub name: String,
    pub version: Version,
    pub installed_at_unix: u64,
    pub last_updated_at_unix: u64,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentState>,
    #[serde(default)]
    pub files: Vec<InstalledFileRecord>,
    #[serde(default)]
    pub transaction_history: Vec<TransactionSummary>,
}

impl InstallationMetadata {
    pub fn new(manifest: &Manifest, now_unix: u64) -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            installed_at_unix: now_unix,
            last_updated_at_unix: now_unix,
            components: BTreeMap::new(),
            files: Vec::new(),
            transaction_history: Vec::new(),
        }
    }

    pub fn record(&self, path: &Path) -> Option<&InstalledFileRecord> {
        self.files.iter().find(|record| record.path == path)
    }

    /// Replaces the record for the same path, keeping records sorted by path.
    pub fn upsert_record(&mut self, record: InstalledFileRecord) {
        match self
            .files
            .binary_search_by(|existing| existing.path.cmp(&record.path))
        {
            Ok(index) => self.files[index] = record,
            Err(index) => self.files.insert(index, record),
        }
    }

    pub fn remove_record(&mut self, path: &Path) -> Option<InstalledFileRecord> {
        let index = self.files.iter().position(|record| record.path == path)?;
        Some(self.files.remove(index))
    }

    pub fn sort_records(&mut self) {
        self.files.sort_by(|left, right| left.path.cmp(&right.path));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Locks older than this are treated as abandoned even if the owner is alive.
    pub lock_stale_after: Duration,
    /// Perform the file effects of one component concurrently.
    pub parallel_copies: bool,
    /// Number of transaction summaries kept in installation metadata.
    pub history_limit: usize,
    pub probe_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_stale_after: Duration::from_secs(3600),
            parallel_copies: true,
            history_limit: 20,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FRAMESET_LOCK_STALE_SECS` and
    /// `FRAMESET_PROBE_TIMEOUT_SECS` when they hold a valid number.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_secs("FRAMESET_LOCK_STALE_SECS") {
            config.lock_stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("FRAMESET_PROBE_TIMEOUT_SECS") {
            config.probe_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn env_secs(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring non-numeric override");
            None
        }
    }
}
