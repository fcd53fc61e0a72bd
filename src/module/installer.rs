//! Module installer
//!
//! Materializes a registered module's code on local storage and installs
//! its dependencies. Concurrent installs of one path share a single ticket:
//! the first caller starts the pipeline, later callers queue on it, and all
//! of them receive the same outcome.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::module::registry::client::RegistryClient;
use crate::module::registry::manifest::ModuleManifest;
use crate::module::registry::path::{self, ModuleSource};
use crate::module::registry::source::unpack_archive;
use crate::module::traits::{InstallStatus, ManagerEvent, ModuleDescriptor, ModuleError};

/// Directory under a module root holding its installed dependencies
pub const DEPENDENCY_DIR: &str = "modules";

type InstallResult = Result<ModuleDescriptor, ModuleError>;

struct Ticket {
    status: InstallStatus,
    descriptor: Option<ModuleDescriptor>,
    waiters: Vec<oneshot::Sender<InstallResult>>,
}

pub struct Installer {
    registry: Arc<RegistryClient>,
    tickets: Mutex<HashMap<String, Ticket>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl Installer {
    pub fn new(registry: Arc<RegistryClient>, events: broadcast::Sender<ManagerEvent>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tickets: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Install the module registered under `path`
    pub async fn install(self: &Arc<Self>, path: &str) -> InstallResult {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut tickets = self.tickets.lock().await;
            match tickets.get_mut(path) {
                Some(ticket) => {
                    debug!("Joining in-flight installation of {}", path);
                    ticket.waiters.push(tx);
                    false
                }
                None => {
                    tickets.insert(
                        path.to_string(),
                        Ticket {
                            status: InstallStatus::Init,
                            descriptor: None,
                            waiters: vec![tx],
                        },
                    );
                    true
                }
            }
        };

        if start {
            let installer = Arc::clone(self);
            let path = path.to_string();
            tokio::spawn(async move {
                let result = installer.pipeline(&path).await;
                installer.finish(&path, result).await;
            });
        }

        rx.await.unwrap_or_else(|_| {
            Err(ModuleError::InstallationFailed(format!(
                "installation of {} was abandoned",
                path
            )))
        })
    }

    /// Status of the open ticket for `path`, if any
    pub async fn status(&self, path: &str) -> Option<InstallStatus> {
        self.tickets.lock().await.get(path).map(|t| t.status)
    }

    /// Statuses of every open ticket
    pub async fn statuses(&self) -> HashMap<String, InstallStatus> {
        self.tickets
            .lock()
            .await
            .iter()
            .map(|(path, ticket)| (path.clone(), ticket.status))
            .collect()
    }

    async fn set_status(&self, path: &str, status: InstallStatus, descriptor: Option<&ModuleDescriptor>) {
        let notify = {
            let mut tickets = self.tickets.lock().await;
            let Some(ticket) = tickets.get_mut(path) else {
                return;
            };
            ticket.status = status;
            if let Some(descriptor) = descriptor {
                ticket.descriptor = Some(descriptor.clone());
            }
            ticket.descriptor.clone()
        };
        debug!("Installation of {} is {:?}", path, status);
        if let Some(descriptor) = notify {
            let _ = self.events.send(ManagerEvent::StateChange(descriptor));
        }
    }

    async fn pipeline(&self, path: &str) -> InstallResult {
        self.set_status(path, InstallStatus::Check, None).await;
        let descriptor = self.registry.require(path).await?;
        self.set_status(path, InstallStatus::Check, Some(&descriptor))
            .await;

        let storage = self.registry.storage_path(&descriptor);
        self.set_status(path, InstallStatus::Download, None).await;
        let fetched = self.materialize(&descriptor.source, &storage).await?;

        self.set_status(path, InstallStatus::Dependencies, None).await;
        let mut stack = vec![descriptor.path.clone()];
        if let Err(e) = self.install_dependencies(storage.clone(), &mut stack).await {
            if fetched {
                remove_dir_if_exists(&storage).await;
            }
            return Err(e);
        }

        info!("Installed module {} at {}", descriptor.name, storage.display());
        Ok(descriptor)
    }

    async fn finish(&self, path: &str, result: InstallResult) {
        let status = if result.is_ok() {
            InstallStatus::Done
        } else {
            InstallStatus::Failed
        };
        self.set_status(path, status, None).await;

        let ticket = self.tickets.lock().await.remove(path);
        if let Err(e) = &result {
            warn!("Installation of {} failed: {}", path, e);
        }
        if let Some(ticket) = ticket {
            for waiter in ticket.waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Make sure `target` holds the code of `source`
    ///
    /// Returns whether anything was fetched.
    async fn materialize(&self, source: &ModuleSource, target: &Path) -> Result<bool, ModuleError> {
        if tokio::fs::metadata(target).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(false);
        }

        let (owner, name, tag) = match source {
            ModuleSource::Local { path } => {
                return Err(ModuleError::InstallationFailed(format!(
                    "local module missing at {}",
                    path.display()
                )))
            }
            ModuleSource::Remote { owner, name, tag } => (
                owner,
                name,
                tag.as_deref().unwrap_or(path::FLOATING_TAG),
            ),
        };

        let partial = partial_path(target);
        remove_dir_if_exists(&partial).await;

        let result = async {
            info!("Fetching {}/{}#{}", owner, name, tag);
            let archive = self.registry.source().fetch_archive(owner, name, tag).await?;

            let dest = partial.clone();
            tokio::task::spawn_blocking(move || unpack_archive(&archive, &dest))
                .await
                .map_err(|e| ModuleError::InstallationFailed(format!("extraction task: {}", e)))??;

            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&partial, target).await?;
            Ok::<(), ModuleError>(())
        }
        .await;

        if let Err(e) = result {
            remove_dir_if_exists(&partial).await;
            remove_dir_if_exists(target).await;
            return Err(e);
        }
        Ok(true)
    }

    /// Install the dependencies declared by the manifest at `root`, recursively
    fn install_dependencies<'a>(
        &'a self,
        root: PathBuf,
        stack: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<(), ModuleError>> {
        async move {
            let manifest = ModuleManifest::from_dir(&root).await?;
            for (dep_name, identifier) in &manifest.dependencies {
                if !is_single_segment(dep_name) {
                    return Err(ModuleError::InvalidManifest(format!(
                        "invalid dependency name {}",
                        dep_name
                    )));
                }

                let canonical = path::augment(identifier, self.registry.source().as_ref())
                    .await
                    .map_err(|e| {
                        ModuleError::InstallationFailed(format!("dependency {}: {}", dep_name, e))
                    })?;
                if stack.contains(&canonical) {
                    return Err(ModuleError::InstallationFailed(format!(
                        "dependency cycle: {} -> {}",
                        stack.join(" -> "),
                        canonical
                    )));
                }

                let source = path::expand(&canonical)
                    .ok_or_else(|| ModuleError::InvalidPath(canonical.clone()))?;
                let target = match &source {
                    ModuleSource::Local { path } => path.clone(),
                    ModuleSource::Remote { .. } => root.join(DEPENDENCY_DIR).join(dep_name),
                };
                debug!("Installing dependency {} ({}) into {}", dep_name, canonical, target.display());
                self.materialize(&source, &target).await?;

                stack.push(canonical);
                self.install_dependencies(target, stack).await?;
                stack.pop();
            }
            Ok(())
        }
        .boxed()
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

fn is_single_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

async fn remove_dir_if_exists(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::registry::oplog::MemoryOpLog;
    use crate::module::registry::source::test_support::ScriptedSource;
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: PathBuf,
        source: Arc<ScriptedSource>,
        registry: Arc<RegistryClient>,
        installer: Arc<Installer>,
        events: broadcast::Receiver<ManagerEvent>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("storage");
        let source = Arc::new(ScriptedSource::default());
        let registry = Arc::new(RegistryClient::new(
            Arc::new(MemoryOpLog::new()),
            source.clone(),
            &storage,
        ));
        let (events_tx, events) = broadcast::channel(256);
        let installer = Installer::new(registry.clone(), events_tx);
        Fixture {
            _dir: dir,
            storage,
            source,
            registry,
            installer,
            events,
        }
    }

    #[tokio::test]
    async fn test_concurrent_installs_share_one_pipeline() {
        let fixture = fixture();
        fixture.source.publish("acme", "widget", "1.2.0", "1.2.0");
        let descriptor = fixture.registry.add("remote:acme/widget", false).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let installer = fixture.installer.clone();
            let path = descriptor.path.clone();
            handles.push(tokio::spawn(async move { installer.install(&path).await }));
        }
        let results: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(fixture.source.fetches(), 1);
        assert!(results.iter().all(|r| r.as_ref() == Ok(&descriptor)));
        let root = fixture.storage.join("acme").join("widget@1.2.0");
        assert!(root.join("module.toml").is_file());
        assert!(!partial_path(&root).exists());
        assert!(fixture.installer.status(&descriptor.path).await.is_none());
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let fixture = fixture();
        fixture.source.publish("acme", "widget", "1.2.0", "1.2.0");
        let descriptor = fixture.registry.add("remote:acme/widget", false).await.unwrap();

        fixture.installer.install(&descriptor.path).await.unwrap();
        fixture.installer.install(&descriptor.path).await.unwrap();

        assert_eq!(fixture.source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_unknown_module() {
        let fixture = fixture();
        let result = fixture.installer.install("remote:acme/ghost#1.0.0").await;
        assert!(matches!(result, Err(ModuleError::ModuleUnknown(_))));
    }

    #[tokio::test]
    async fn test_failed_fetch_reaches_every_waiter_and_cleans_up() {
        let fixture = fixture();
        fixture.source.publish("acme", "widget", "1.2.0", "1.2.0");
        let descriptor = fixture.registry.add("remote:acme/widget", false).await.unwrap();
        fixture.source.fail_archives.store(true, Ordering::SeqCst);

        let (first, second) = tokio::join!(
            fixture.installer.install(&descriptor.path),
            fixture.installer.install(&descriptor.path)
        );

        assert!(matches!(first, Err(ModuleError::Fetch(_))));
        assert_eq!(first, second);
        assert_eq!(fixture.source.fetches(), 1);
        let root = fixture.storage.join("acme").join("widget@1.2.0");
        assert!(!root.exists());
        assert!(!partial_path(&root).exists());
    }

    #[tokio::test]
    async fn test_state_changes_are_emitted() {
        let mut fixture = fixture();
        fixture.source.publish("acme", "widget", "1.2.0", "1.2.0");
        let descriptor = fixture.registry.add("remote:acme/widget", false).await.unwrap();

        fixture.installer.install(&descriptor.path).await.unwrap();

        let mut changes = 0;
        while let Ok(event) = fixture.events.try_recv() {
            if event == ManagerEvent::StateChange(descriptor.clone()) {
                changes += 1;
            }
        }
        // check, download, dependencies, done
        assert_eq!(changes, 4);
    }

    #[tokio::test]
    async fn test_dependencies_installed_in_place() {
        let fixture = fixture();
        fixture.source.publish("acme", "gadget", "0.3.0", "0.3.0");
        fixture.source.publish_manifest(
            "acme",
            "widget",
            "1.0.0",
            "name = \"widget\"\nversion = \"1.0.0\"\nentry_point = \"run.sh\"\n\n\
             [dependencies]\ngadget = \"remote:acme/gadget\"\n"
                .to_string(),
        );
        let descriptor = fixture.registry.add("remote:acme/widget", false).await.unwrap();

        fixture.installer.install(&descriptor.path).await.unwrap();

        let dependency = fixture
            .storage
            .join("acme")
            .join("widget@1.0.0")
            .join(DEPENDENCY_DIR)
            .join("gadget");
        assert!(dependency.join("module.toml").is_file());
        assert_eq!(fixture.source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_dependency_cycle_fails() {
        let fixture = fixture();
        fixture.source.publish_manifest(
            "acme",
            "widget",
            "1.0.0",
            "name = \"widget\"\nversion = \"1.0.0\"\nentry_point = \"run.sh\"\n\n\
             [dependencies]\ngadget = \"remote:acme/gadget#1.0.0\"\n"
                .to_string(),
        );
        fixture.source.publish_manifest(
            "acme",
            "gadget",
            "1.0.0",
            "name = \"gadget\"\nversion = \"1.0.0\"\nentry_point = \"run.sh\"\n\n\
             [dependencies]\nwidget = \"remote:acme/widget#1.0.0\"\n"
                .to_string(),
        );
        let descriptor = fixture.registry.add("remote:acme/widget", false).await.unwrap();

        let result = fixture.installer.install(&descriptor.path).await;

        assert!(matches!(result, Err(ModuleError::InstallationFailed(_))));
        assert!(!fixture.storage.join("acme").join("widget@1.0.0").exists());
    }

    #[tokio::test]
    async fn test_missing_local_module_fails_hard() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("module.toml"),
            "name = \"gadget\"\nversion = \"0.1.0\"\nentry_point = \"run.sh\"\n",
        )
        .unwrap();
        let descriptor = fixture
            .registry
            .add(dir.path().to_str().unwrap(), false)
            .await
            .unwrap();
        drop(dir);

        let result = fixture.installer.install(&descriptor.path).await;
        assert!(matches!(result, Err(ModuleError::InstallationFailed(_))));
    }

    #[test]
    fn test_single_segment() {
        assert!(is_single_segment("gadget"));
        assert!(!is_single_segment("../gadget"));
        assert!(!is_single_segment("a/b"));
        assert!(!is_single_segment(""));
    }
}
