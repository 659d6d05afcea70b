use std::collections::HashSet;
use std::fs;
use std::path::{Component as PathComponent, Path};

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::pattern::PatternSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Directory holding the component's files, relative to the manifest's source root.
    pub source: String,
    /// Directory the files are installed into, relative to the target root.
    pub target: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Config files (relative to `target`) that are merged instead of replaced on update.
    #[serde(default)]
    pub merge: Vec<String>,
}

fn default_required() -> bool {
    true
}

impl Component {
    pub fn pattern_set(&self) -> Result<PatternSet> {
        PatternSet::parse(&self.patterns)
            .with_context(|| format!("invalid patterns for component '{}'", self.name))
    }

    pub fn merge_set(&self) -> Result<PatternSet> {
        PatternSet::parse(&self.merge)
            .with_context(|| format!("invalid merge patterns for component '{}'", self.name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub min_free_bytes: Option<u64>,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Manifest {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse frameset manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_str(input).context("failed to parse frameset manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Loads a manifest file; the format is chosen by extension (`.json`, otherwise TOML).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest: {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        };
        parsed.with_context(|| format!("invalid manifest: {}", path.display()))
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|component| component.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("manifest name must not be empty"));
        }

        let mut seen = HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() {
                return Err(anyhow!("component name must not be empty"));
            }
            validate_relative_path(&component.source).with_context(|| {
                format!("invalid source for component '{}'", component.name)
            })?;
            validate_relative_path(&component.target).with_context(|| {
                format!("invalid target for component '{}'", component.name)
            })?;
            if component.patterns.is_empty() {
                return Err(anyhow!(
                    "component '{}' must declare at least one pattern",
                    component.name
                ));
            }
            component.pattern_set()?;
            component.merge_set()?;

            for dependency in &component.depends_on {
                if dependency == &component.name {
                    return Err(anyhow!("component '{}' depends on itself", component.name));
                }
                if !seen.contains(dependency.as_str()) {
                    return Err(anyhow!(
                        "component '{}' depends on '{}', which is not declared before it",
                        component.name,
                        dependency
                    ));
                }
            }

            if !seen.insert(component.name.as_str()) {
                return Err(anyhow!("duplicate component '{}'", component.name));
            }
        }
        Ok(())
    }
}

/// Accepts `.` and plain relative paths; rejects absolute paths, drive
/// prefixes and any `..` component.
pub fn validate_relative_path(value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    let path = Path::new(value);
    if path.is_absolute() || value.starts_with('/') || value.starts_with('\\') {
        return Err(anyhow!("path must be relative: {value}"));
    }
    for component in path.components() {
        match component {
            PathComponent::Normal(_) | PathComponent::CurDir => {}
            PathComponent::ParentDir => {
                return Err(anyhow!("path must not contain '..': {value}"));
            }
            PathComponent::RootDir | PathComponent::Prefix(_) => {
                return Err(anyhow!("path must be relative: {value}"));
            }
        }
    }
    Ok(())
}
