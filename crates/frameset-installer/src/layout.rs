use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".frameset";
pub const BACKUPS_DIR_NAME: &str = ".frameset-backups";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    root: PathBuf,
}

impl TargetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("lock")
    }

    pub fn metadata_rel_path(&self) -> PathBuf {
        Path::new(STATE_DIR_NAME).join("metadata.json")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.resolve(&self.metadata_rel_path())
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.state_dir().join("transactions")
    }

    pub fn transactions_staging_dir(&self) -> PathBuf {
        self.transactions_dir().join("staging")
    }

    pub fn transaction_metadata_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn transaction_journal_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.journal"))
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.transactions_staging_dir().join(txid)
    }

    pub fn backups_rel_dir(&self) -> PathBuf {
        PathBuf::from(BACKUPS_DIR_NAME)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR_NAME)
    }

    /// True for paths owned by the engine itself rather than by a component.
    pub fn is_reserved(&self, rel: &Path) -> bool {
        match rel.components().find(|c| !matches!(c, Component::CurDir)) {
            Some(Component::Normal(first)) => first == STATE_DIR_NAME || first == BACKUPS_DIR_NAME,
            _ => false,
        }
    }

    pub fn ensure_state_dirs(&self) -> Result<()> {
        for dir in [
            self.state_dir(),
            self.transactions_dir(),
            self.transactions_staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_target_root() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var("FRAMESET_TARGET") {
        if !explicit.trim().is_empty() {
            return Ok(PathBuf::from(explicit));
        }
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows target root")?;
        return Ok(PathBuf::from(app_data).join("Frameset"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve target root")?;
    Ok(PathBuf::from(home).join(".frameset-home"))
}
