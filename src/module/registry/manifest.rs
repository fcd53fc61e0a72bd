//! Module manifest parsing and validation
//!
//! Handles parsing module.toml manifests and validating module metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::module::registry::source::MANIFEST_FILE;
use crate::module::traits::ModuleError;

/// Module manifest (module.toml structure)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Module name, also its address on the bus
    pub name: String,
    /// Module version (semantic versioning)
    pub version: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Module entry point (path relative to the module root, or a program on PATH)
    pub entry_point: String,
    /// Extra arguments passed to the entry point
    #[serde(default)]
    pub args: Vec<String>,
    /// Dependencies (name -> module identifier), installed under `modules/<name>`
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl ModuleManifest {
    /// Parse and validate manifest contents
    pub fn parse(contents: &str) -> Result<Self, ModuleError> {
        let manifest: ModuleManifest = toml::from_str(contents).map_err(|e| {
            ModuleError::InvalidManifest(format!("Failed to parse manifest TOML: {}", e))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load manifest from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModuleError::InvalidManifest(format!("Failed to read manifest file: {}", e))
        })?;
        Self::parse(&contents)
    }

    /// Load `module.toml` from a module root directory
    pub async fn from_dir(root: &Path) -> Result<Self, ModuleError> {
        let file = root.join(MANIFEST_FILE);
        let contents = tokio::fs::read_to_string(&file).await.map_err(|e| {
            ModuleError::InvalidManifest(format!("Failed to read {}: {}", file.display(), e))
        })?;
        Self::parse(&contents)
    }

    fn validate(&self) -> Result<(), ModuleError> {
        if self.name.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "Module name cannot be empty".to_string(),
            ));
        }
        if self.name == crate::module::ipc::protocol::HOST_ENDPOINT
            || self.name == crate::module::ipc::protocol::WILDCARD
        {
            return Err(ModuleError::InvalidManifest(format!(
                "Module name {} is reserved",
                self.name
            )));
        }
        if self.entry_point.is_empty() {
            return Err(ModuleError::InvalidManifest(
                "Entry point cannot be empty".to_string(),
            ));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            ModuleError::InvalidManifest(format!("Invalid version {}: {}", self.version, e))
        })?;
        Ok(())
    }

    /// Resolve the entry point against the module root, falling back to PATH
    pub fn resolve_entry_point(&self, root: &Path) -> Result<PathBuf, ModuleError> {
        let local = root.join(&self.entry_point);
        if local.is_file() {
            return Ok(local);
        }

        let on_path = std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(&self.entry_point))
                .find(|candidate| candidate.is_file())
        });
        on_path.ok_or_else(|| {
            ModuleError::SpawnFailed(format!(
                "Entry point {} not found in {} or on PATH",
                self.entry_point,
                root.display()
            ))
        })
    }
}
