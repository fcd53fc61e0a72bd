//! Configuration management for module-host
//!
//! Handles configuration loading and validation. Files may be JSON or TOML;
//! every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Module storage and supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Root under which remote modules are materialized
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Directory for per-module output logs
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Append-only registry operation log
    #[serde(default = "default_registry_log")]
    pub registry_log: PathBuf,

    /// Automatic restarts allowed after unexpected exits
    #[serde(default = "default_restart_cap")]
    pub restart_cap: u32,

    /// Grace period between a kill request and forced termination
    #[serde(default = "default_kill_grace_millis")]
    pub kill_grace_millis: u64,

    /// Keep module output in memory only
    #[serde(default)]
    pub private_output: bool,

    /// Lines of output kept in memory per module
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("data/modules")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("data/logs")
}

fn default_registry_log() -> PathBuf {
    PathBuf::from("data/registry.jsonl")
}

fn default_restart_cap() -> u32 {
    3
}

fn default_kill_grace_millis() -> u64 {
    5000
}

fn default_output_buffer_lines() -> usize {
    500
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            logs_dir: default_logs_dir(),
            registry_log: default_registry_log(),
            restart_cap: default_restart_cap(),
            kill_grace_millis: default_kill_grace_millis(),
            private_output: false,
            output_buffer_lines: default_output_buffer_lines(),
        }
    }
}

impl ModulesConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }

    /// Place every relative directory under `base`
    pub fn rebase(&mut self, base: &Path) {
        for dir in [
            &mut self.storage_dir,
            &mut self.logs_dir,
            &mut self.registry_log,
        ] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
}

/// Remote module host configuration (GitHub-compatible API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// REST API base, used for tag listings and tarballs
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Raw file host, used for manifests
    #[serde(default = "default_raw_base")]
    pub raw_base: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_raw_base() -> String {
    "https://raw.githubusercontent.com".to_string()
}

fn default_user_agent() -> String {
    format!("modhost/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_seconds() -> u64 {
    60
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            raw_base: default_raw_base(),
            user_agent: default_user_agent(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "module_host=debug"
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub modules: ModulesConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HostConfig {
    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HostConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HostConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load a JSON or TOML file, chosen by extension, and validate it
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path)?,
            Some("toml") => Self::from_toml_file(path)?,
            other => anyhow::bail!(
                "Unsupported config format {:?} for {}",
                other,
                path.display()
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.modules.output_buffer_lines == 0 {
            return Err(anyhow::anyhow!(
                "output_buffer_lines must be greater than 0"
            ));
        }
        if self.remote.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("remote timeout_seconds must be greater than 0"));
        }
        if cfg!(not(feature = "json-logging")) && self.logging.json_format {
            return Err(anyhow::anyhow!(
                "json_format requires the 'json-logging' feature"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.modules.restart_cap, 3);
        assert_eq!(config.modules.kill_grace(), Duration::from_secs(5));
        assert!(!config.modules.private_output);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modhost.toml");
        std::fs::write(&path, "[modules]\nrestart_cap = 1\nprivate_output = true\n").unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.modules.restart_cap, 1);
        assert!(config.modules.private_output);
        assert_eq!(config.modules.kill_grace_millis, 5000);
        assert_eq!(config.remote.api_base, "https://api.github.com");
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modhost.json");
        let mut config = HostConfig::default();
        config.modules.output_buffer_lines = 42;
        config.to_json_file(&path).unwrap();

        let loaded = HostConfig::load(&path).unwrap();
        assert_eq!(loaded.modules.output_buffer_lines, 42);
    }

    #[test]
    fn test_rejects_unknown_extension_and_zero_buffer() {
        assert!(HostConfig::load(Path::new("modhost.yaml")).is_err());

        let mut config = HostConfig::default();
        config.modules.output_buffer_lines = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rebase() {
        let mut modules = ModulesConfig::default();
        modules.logs_dir = PathBuf::from("/var/log/modhost");
        modules.rebase(Path::new("/srv/host"));
        assert_eq!(modules.storage_dir, PathBuf::from("/srv/host/data/modules"));
        assert_eq!(modules.logs_dir, PathBuf::from("/var/log/modhost"));
    }
}
