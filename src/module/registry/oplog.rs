//! Append-only operation log backing the module registry
//!
//! The registry never stores its current state directly. It appends
//! [`RegistryOp`]s and folds the full log into a snapshot on read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::module::traits::{ModuleDescriptor, ModuleError};

/// One registry operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryOp {
    /// Register a descriptor. With `replace`, entries sharing its name are dropped.
    Add {
        descriptor: ModuleDescriptor,
        #[serde(default)]
        replace: bool,
    },
    /// Unregister the descriptor with this canonical path
    Remove { path: String },
}

/// External append-only store
#[async_trait]
pub trait OpLog: Send + Sync {
    async fn append(&self, op: RegistryOp) -> Result<(), ModuleError>;

    /// Every operation in append order
    async fn read_all(&self) -> Result<Vec<RegistryOp>, ModuleError>;
}

/// In-memory log, used by tests and ephemeral hosts
#[derive(Default)]
pub struct MemoryOpLog {
    ops: Mutex<Vec<RegistryOp>>,
}

impl MemoryOpLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OpLog for MemoryOpLog {
    async fn append(&self, op: RegistryOp) -> Result<(), ModuleError> {
        self.ops.lock().await.push(op);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<RegistryOp>, ModuleError> {
        Ok(self.ops.lock().await.clone())
    }
}

/// JSON-lines file log, one operation per line
pub struct FileOpLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileOpLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl OpLog for FileOpLog {
    async fn append(&self, op: RegistryOp) -> Result<(), ModuleError> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(&op)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<RegistryOp>, ModuleError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ops = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(op) => ops.push(op),
                // A torn trailing write must not hide the rest of the registry
                Err(e) => warn!(
                    "Skipping unreadable registry entry {} in {}: {}",
                    index + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(ops)
    }
}
