//! Module system types shared by the registry, installer, supervisor and bus
//!
//! Defines the descriptor of a registered module, lifecycle states, the
//! list view handed to collaborators, and the module error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::module::registry::path::ModuleSource;

/// A registered module
///
/// Identity is the canonical path. Descriptors are replaced wholesale,
/// never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Canonical path (`remote:owner/name#tag` or `local:/abs/path`)
    pub path: String,
    /// Parsed source of the canonical path
    pub source: ModuleSource,
    /// Module name from the manifest (bus address while running)
    pub name: String,
    /// Semantic version from the manifest
    pub version: String,
}

impl ModuleDescriptor {
    /// Owner for remote modules
    pub fn owner(&self) -> Option<&str> {
        match &self.source {
            ModuleSource::Remote { owner, .. } => Some(owner),
            ModuleSource::Local { .. } => None,
        }
    }

    /// Tag for remote modules
    pub fn tag(&self) -> Option<&str> {
        match &self.source {
            ModuleSource::Remote { tag, .. } => tag.as_deref(),
            ModuleSource::Local { .. } => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.source, ModuleSource::Local { .. })
    }
}

/// Supervisor state of a managed module process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Process spawned, ready notification not yet seen
    Starting,
    /// Ready notification seen, `init` issued
    Running,
    /// Exited unexpectedly, a new launch is being attempted
    Restarting,
    /// `kill` in progress
    Stopping,
}

/// Installation ticket status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Init,
    Check,
    Download,
    Dependencies,
    Done,
    Failed,
}

/// What `list()` reports for one registered module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleView {
    pub path: String,
    pub name: String,
    pub version: String,
    pub local: bool,
    /// A live process exists for this module name
    pub running: bool,
    /// Supervisor state, if the module is managed
    pub state: Option<ModuleState>,
    /// The running code was superseded by `update`
    pub need_restart: bool,
    /// An installation ticket is open for this path
    pub installing: bool,
    pub install_status: Option<InstallStatus>,
    pub restarts: u32,
}

/// Lifecycle notifications observed by collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// An install, run, restart or kill transition happened for this module
    StateChange(ModuleDescriptor),
    /// A running module's code was superseded and needs a manual restart
    UpdateReady(ModuleDescriptor),
    /// An `rpc_call` passed through the dispatcher
    RpcTrace {
        source: String,
        destination: String,
        procedure: String,
    },
}

/// Module system errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("Invalid module path: {0}")]
    InvalidPath(String),

    #[error("Module path could not be resolved: {0}")]
    Resolution(String),

    #[error("Module conflict: {0}")]
    Conflict(String),

    #[error("Module unknown: {0}")]
    ModuleUnknown(String),

    #[error("Invalid module manifest: {0}")]
    InvalidManifest(String),

    #[error("Module installation failed: {0}")]
    InstallationFailed(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Module already running: {0}")]
    AlreadyRunning(String),

    #[error("Module not running: {0}")]
    NotRunning(String),

    #[error("Failed to spawn module process: {0}")]
    SpawnFailed(String),

    #[error("IPC communication error: {0}")]
    IpcError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Module operation failed: {0}")]
    OperationError(String),
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        ModuleError::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for ModuleError {
    fn from(e: toml::de::Error) -> Self {
        ModuleError::InvalidManifest(e.to_string())
    }
}

impl From<std::io::Error> for ModuleError {
    fn from(e: std::io::Error) -> Self {
        ModuleError::Io(e.to_string())
    }
}

impl From<anyhow::Error> for ModuleError {
    fn from(e: anyhow::Error) -> Self {
        ModuleError::OperationError(e.to_string())
    }
}
