//! Registry client
//!
//! Folds the operation log into the current set of registered modules and
//! implements `add`/`remove` against it. Snapshots are cached until the next
//! append.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::module::registry::manifest::ModuleManifest;
use crate::module::registry::oplog::{OpLog, RegistryOp};
use crate::module::registry::path::{self, ModuleSource};
use crate::module::registry::source::RemoteSource;
use crate::module::traits::{ModuleDescriptor, ModuleError};

/// Canonical path -> descriptor
pub type RegistrySnapshot = BTreeMap<String, ModuleDescriptor>;

/// Fold a sequence of operations into a snapshot
pub fn fold(ops: &[RegistryOp]) -> RegistrySnapshot {
    let mut snapshot = RegistrySnapshot::new();
    for op in ops {
        match op {
            RegistryOp::Add {
                descriptor,
                replace,
            } => {
                if *replace {
                    snapshot.retain(|_, existing| existing.name != descriptor.name);
                }
                snapshot.insert(descriptor.path.clone(), descriptor.clone());
            }
            RegistryOp::Remove { path } => {
                snapshot.remove(path);
            }
        }
    }
    snapshot
}

pub struct RegistryClient {
    oplog: Arc<dyn OpLog>,
    source: Arc<dyn RemoteSource>,
    storage_root: PathBuf,
    cache: RwLock<Option<Arc<RegistrySnapshot>>>,
    // Serializes conflict checks with the append that follows them
    write_lock: Mutex<()>,
}

impl RegistryClient {
    pub fn new(
        oplog: Arc<dyn OpLog>,
        source: Arc<dyn RemoteSource>,
        storage_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            oplog,
            source,
            storage_root: storage_root.into(),
            cache: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Current registry contents
    pub async fn snapshot(&self) -> Result<Arc<RegistrySnapshot>, ModuleError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }
        let ops = self.oplog.read_all().await?;
        let snapshot = Arc::new(fold(&ops));
        debug!("Folded {} registry operations into {} modules", ops.len(), snapshot.len());
        *cache = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn get(&self, path: &str) -> Result<Option<ModuleDescriptor>, ModuleError> {
        Ok(self.snapshot().await?.get(path).cloned())
    }

    /// Descriptor for `path`, or a "module unknown" error
    pub async fn require(&self, path: &str) -> Result<ModuleDescriptor, ModuleError> {
        self.get(path)
            .await?
            .ok_or_else(|| ModuleError::ModuleUnknown(path.to_string()))
    }

    /// Local directory for a registered module
    pub fn storage_path(&self, descriptor: &ModuleDescriptor) -> PathBuf {
        path::storage_path(&descriptor.source, &self.storage_root)
    }

    /// Resolve, conflict-check, read the manifest, and register a module
    pub async fn add(&self, identifier: &str, force: bool) -> Result<ModuleDescriptor, ModuleError> {
        let canonical = path::augment(identifier, self.source.as_ref()).await?;
        let source = path::expand(&canonical)
            .ok_or_else(|| ModuleError::InvalidPath(canonical.clone()))?;

        let _guard = self.write_lock.lock().await;
        let snapshot = self.snapshot().await?;
        if !force {
            check_source_conflicts(&snapshot, &canonical, &source)?;
        }

        let manifest = self.read_manifest(&source).await?;
        if !force {
            if let Some(existing) = snapshot.values().find(|d| d.name == manifest.name) {
                return Err(ModuleError::Conflict(format!(
                    "name {} is already used by {}",
                    manifest.name, existing.path
                )));
            }
        }

        let descriptor = ModuleDescriptor {
            path: canonical,
            source,
            name: manifest.name,
            version: manifest.version,
        };
        self.append(RegistryOp::Add {
            descriptor: descriptor.clone(),
            replace: force,
        })
        .await?;
        info!("Registered module {} ({}) at {}", descriptor.name, descriptor.version, descriptor.path);
        Ok(descriptor)
    }

    /// Unregister a module, deleting its local storage unless it is a local module
    pub async fn remove(&self, path: &str) -> Result<ModuleDescriptor, ModuleError> {
        let _guard = self.write_lock.lock().await;
        let descriptor = self.require(path).await?;
        self.append(RegistryOp::Remove {
            path: descriptor.path.clone(),
        })
        .await?;

        if !descriptor.is_local() {
            self.purge_storage(&descriptor).await?;
        }
        info!("Removed module {} ({})", descriptor.name, descriptor.path);
        Ok(descriptor)
    }

    /// Delete the materialized code of a remote module
    pub async fn purge_storage(&self, descriptor: &ModuleDescriptor) -> Result<(), ModuleError> {
        if descriptor.is_local() {
            return Ok(());
        }
        let storage = self.storage_path(descriptor);
        match tokio::fs::remove_dir_all(&storage).await {
            Ok(()) => {
                debug!("Deleted storage {}", storage.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a module's manifest from disk (local) or from its remote source
    pub async fn read_manifest(&self, source: &ModuleSource) -> Result<ModuleManifest, ModuleError> {
        match source {
            ModuleSource::Local { path } => ModuleManifest::from_dir(path).await,
            ModuleSource::Remote { owner, name, tag } => {
                let tag = tag.as_deref().unwrap_or(path::FLOATING_TAG);
                let contents = self.source.fetch_manifest(owner, name, tag).await?;
                ModuleManifest::parse(&contents)
            }
        }
    }

    async fn append(&self, op: RegistryOp) -> Result<(), ModuleError> {
        let result = self.oplog.append(op).await;
        // Invalidate even on failure: the store may have partially applied it
        *self.cache.write().await = None;
        result
    }
}

fn check_source_conflicts(
    snapshot: &RegistrySnapshot,
    canonical: &str,
    source: &ModuleSource,
) -> Result<(), ModuleError> {
    if snapshot.contains_key(canonical) {
        return Err(ModuleError::Conflict(format!("{} is already registered", canonical)));
    }

    if let ModuleSource::Remote { owner, name, .. } = source {
        for existing in snapshot.values() {
            if let ModuleSource::Remote {
                owner: other_owner,
                name: other_name,
                ..
            } = &existing.source
            {
                if other_owner == owner && other_name == name {
                    return Err(ModuleError::Conflict(format!(
                        "{}/{} is already registered as {}",
                        owner, name, existing.path
                    )));
                }
            }
            if &existing.name == name {
                return Err(ModuleError::Conflict(format!(
                    "name {} is already used by {}",
                    name, existing.path
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::registry::oplog::MemoryOpLog;
    use crate::module::registry::source::test_support::ScriptedSource;

    fn registry(source: Arc<ScriptedSource>) -> RegistryClient {
        RegistryClient::new(Arc::new(MemoryOpLog::new()), source, "/tmp/unused-storage")
    }

    fn widget_source() -> Arc<ScriptedSource> {
        let source = Arc::new(ScriptedSource::default());
        source.publish("acme", "widget", "1.0.0", "1.0.0");
        source.publish("acme", "widget", "1.2.0", "1.2.0");
        source.publish("acme", "widget", "2.0.0-beta", "2.0.0-beta");
        source
    }

    #[tokio::test]
    async fn test_add_resolves_highest_release() {
        let registry = registry(widget_source());

        let descriptor = registry.add("remote:acme/widget", false).await.unwrap();

        assert_eq!(descriptor.path, "remote:acme/widget#1.2.0");
        assert_eq!(descriptor.name, "widget");
        assert_eq!(descriptor.version, "1.2.0");
        assert_eq!(registry.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_readd_without_force_always_conflicts() {
        let registry = registry(widget_source());
        registry.add("remote:acme/widget", false).await.unwrap();

        for _ in 0..3 {
            let result = registry.add("remote:acme/widget", false).await;
            assert!(matches!(result, Err(ModuleError::Conflict(_))));
        }
        // A different tag of the same owner/name conflicts too
        let result = registry.add("remote:acme/widget#1.0.0", false).await;
        assert!(matches!(result, Err(ModuleError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_force_replaces_same_name() {
        let registry = registry(widget_source());
        registry.add("remote:acme/widget", false).await.unwrap();

        let replaced = registry.add("remote:acme/widget#1.0.0", true).await.unwrap();

        let snapshot = registry.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&replaced.path).unwrap().version, "1.0.0");
    }

    #[tokio::test]
    async fn test_unknown_tag_is_resolution_error() {
        let registry = registry(widget_source());
        let result = registry.add("remote:acme/widget#9.0.0", false).await;
        assert!(matches!(result, Err(ModuleError::Resolution(_))));
    }

    #[tokio::test]
    async fn test_invalid_identifier() {
        let registry = registry(widget_source());
        let result = registry.add("widget", false).await;
        assert!(matches!(result, Err(ModuleError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_remove_unknown_module() {
        let registry = registry(widget_source());
        let result = registry.remove("remote:acme/widget#1.2.0").await;
        assert!(matches!(result, Err(ModuleError::ModuleUnknown(_))));
    }

    #[tokio::test]
    async fn test_add_local_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("module.toml"),
            "name = \"gadget\"\nversion = \"0.1.0\"\nentry_point = \"run.sh\"\n",
        )
        .unwrap();
        let registry = registry(Arc::new(ScriptedSource::default()));

        let descriptor = registry
            .add(dir.path().to_str().unwrap(), false)
            .await
            .unwrap();

        assert!(descriptor.is_local());
        assert!(descriptor.path.starts_with("local:"));
        assert_eq!(descriptor.name, "gadget");

        // Local modules keep their code when removed
        registry.remove(&descriptor.path).await.unwrap();
        assert!(dir.path().join("module.toml").exists());
    }

    #[test]
    fn test_fold_replace_drops_same_name() {
        let first = ModuleDescriptor {
            path: "remote:acme/widget#1.0.0".to_string(),
            source: path::expand("remote:acme/widget#1.0.0").unwrap(),
            name: "widget".to_string(),
            version: "1.0.0".to_string(),
        };
        let second = ModuleDescriptor {
            path: "remote:acme/widget#1.1.0".to_string(),
            source: path::expand("remote:acme/widget#1.1.0").unwrap(),
            name: "widget".to_string(),
            version: "1.1.0".to_string(),
        };
        let ops = vec![
            RegistryOp::Add {
                descriptor: first,
                replace: false,
            },
            RegistryOp::Add {
                descriptor: second.clone(),
                replace: true,
            },
        ];

        let snapshot = fold(&ops);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.values().next(), Some(&second));
    }
}
