//! Module manager
//!
//! Facade the host application talks to. Wires the registry, installer,
//! supervisor, message hub and host endpoint together and exposes the public
//! module operations plus a stream of lifecycle notifications.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{HostConfig, ModulesConfig};
use crate::module::api::host::{HostEndpoint, Procedure};
use crate::module::api::hub::{HubHandle, MessageHub};
use crate::module::installer::Installer;
use crate::module::ipc::protocol::RpcError;
use crate::module::process::spawner::LaunchSpec;
use crate::module::process::supervisor::{RunningTable, Supervisor, SupervisorConfig};
use crate::module::registry::client::RegistryClient;
use crate::module::registry::manifest::ModuleManifest;
use crate::module::registry::oplog::{FileOpLog, OpLog};
use crate::module::registry::path::{self, ModuleSource, FLOATING_TAG};
use crate::module::registry::source::RemoteSource;
use crate::module::traits::{ManagerEvent, ModuleDescriptor, ModuleError, ModuleView};

/// Capacity of the lifecycle notification channel
const EVENT_CAPACITY: usize = 1024;

/// Module manager coordinates registered and running modules
pub struct ModuleManager {
    registry: Arc<RegistryClient>,
    installer: Arc<Installer>,
    supervisor: Arc<Supervisor>,
    core: Arc<HostEndpoint>,
    events: broadcast::Sender<ManagerEvent>,
    logs_dir: PathBuf,
    hub_task: JoinHandle<()>,
}

impl ModuleManager {
    /// Create a manager over an oplog store and a remote source
    ///
    /// Must be called from within a tokio runtime: the message hub and the
    /// supervisor's exit handler are spawned here.
    pub fn new(
        config: &ModulesConfig,
        oplog: Arc<dyn OpLog>,
        source: Arc<dyn RemoteSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(RegistryClient::new(oplog, source, &config.storage_dir));
        let installer = Installer::new(Arc::clone(&registry), events.clone());

        let table: RunningTable = Arc::new(Mutex::new(HashMap::new()));
        let (hub, hub_rx) = HubHandle::channel();
        let core = Arc::new(HostEndpoint::new(hub.clone()));
        let hub_task = MessageHub::new(
            Arc::clone(&table),
            Arc::clone(&core),
            events.clone(),
            hub.clone(),
        )
        .spawn(hub_rx);
        let supervisor = Supervisor::new(
            SupervisorConfig::from(config),
            table,
            Arc::clone(&core),
            hub,
            events.clone(),
        );

        info!(
            "Module manager ready (storage {}, logs {})",
            config.storage_dir.display(),
            config.logs_dir.display()
        );

        Self {
            registry,
            installer,
            supervisor,
            core,
            events,
            logs_dir: config.logs_dir.clone(),
            hub_task,
        }
    }

    /// Create a manager from host configuration: file-backed oplog, HTTP source
    pub fn from_config(config: &HostConfig) -> Result<Self, ModuleError> {
        let oplog: Arc<dyn OpLog> = Arc::new(FileOpLog::new(&config.modules.registry_log));
        Ok(Self::new(&config.modules, oplog, default_source(config)?))
    }

    /// Lifecycle notifications: state changes, update readiness, rpc traces
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<RegistryClient> {
        &self.registry
    }

    /// Register a module
    pub async fn add(&self, identifier: &str, force: bool) -> Result<ModuleDescriptor, ModuleError> {
        self.registry.add(identifier, force).await
    }

    /// Materialize a registered module and its dependencies
    pub async fn install(&self, path: &str) -> Result<ModuleDescriptor, ModuleError> {
        self.installer.install(path).await
    }

    /// Unregister a module, killing it first if it is running
    pub async fn remove(&self, path: &str) -> Result<ModuleDescriptor, ModuleError> {
        let descriptor = self.registry.require(path).await?;
        if self.supervisor.is_running(&descriptor.name).await {
            self.supervisor.kill(&descriptor.name).await?;
        }
        self.registry.remove(path).await
    }

    /// Bring a module's code up to date
    ///
    /// Local modules are left alone. Modules on a branch are purged and
    /// fetched again. Modules on a release tag move to the newest release,
    /// if there is one. A running module is never restarted: it is flagged
    /// `need_restart` and an `UpdateReady` notification fires instead.
    pub async fn update(&self, path: &str) -> Result<ModuleDescriptor, ModuleError> {
        let current = self.registry.require(path).await?;
        let (owner, name, tag) = match &current.source {
            ModuleSource::Local { .. } => {
                debug!("Module {} is local, nothing to update", current.name);
                return Ok(current);
            }
            ModuleSource::Remote { owner, name, tag } => (
                owner.clone(),
                name.clone(),
                tag.clone().unwrap_or_else(|| FLOATING_TAG.to_string()),
            ),
        };

        let updated = match path::parse_tag_version(&tag) {
            Some(installed) => {
                let newest = path::augment(
                    &format!("remote:{}/{}", owner, name),
                    self.registry.source().as_ref(),
                )
                .await?;
                let newer = match path::expand(&newest) {
                    Some(ModuleSource::Remote { tag: Some(t), .. }) => path::parse_tag_version(&t)
                        .map(|v| v > installed)
                        .unwrap_or(false),
                    _ => false,
                };
                if newer {
                    info!("Updating module {} from {} to {}", current.name, current.path, newest);
                    let updated = self.registry.add(&newest, true).await?;
                    self.installer.install(&updated.path).await?;
                    if !self.supervisor.is_running(&current.name).await {
                        self.registry.purge_storage(&current).await?;
                    }
                    updated
                } else {
                    debug!("Module {} is already at the newest release", current.name);
                    self.installer.install(&current.path).await?
                }
            }
            None => {
                info!("Refreshing module {} from branch {}", current.name, tag);
                let refreshed = self.registry.add(&current.path, true).await?;
                self.registry.purge_storage(&refreshed).await?;
                self.installer.install(&refreshed.path).await?
            }
        };

        if updated.version != current.version {
            let flagged = {
                let mut table = self.supervisor.table().lock().await;
                match table.get_mut(&current.name) {
                    Some(entry) => {
                        entry.need_restart = true;
                        true
                    }
                    None => false,
                }
            };
            if flagged {
                info!(
                    "Module {} updated to {} while running, restart required",
                    updated.name, updated.version
                );
                let _ = self.events.send(ManagerEvent::UpdateReady(updated.clone()));
            }
        }
        Ok(updated)
    }

    /// Registered modules overlaid with supervisor and installer state
    pub async fn list(&self) -> Result<Vec<ModuleView>, ModuleError> {
        let snapshot = self.registry.snapshot().await?;
        let statuses = self.installer.statuses().await;
        let table = self.supervisor.table().lock().await;

        Ok(snapshot
            .values()
            .map(|descriptor| {
                let entry = table.get(&descriptor.name);
                let install_status = statuses.get(&descriptor.path).copied();
                ModuleView {
                    path: descriptor.path.clone(),
                    name: descriptor.name.clone(),
                    version: descriptor.version.clone(),
                    local: descriptor.is_local(),
                    running: entry.map(|e| e.outbox.is_some()).unwrap_or(false),
                    state: entry.map(|e| e.state),
                    need_restart: entry.map(|e| e.need_restart).unwrap_or(false),
                    installing: install_status.is_some(),
                    install_status,
                    restarts: entry.map(|e| e.restarts).unwrap_or(0),
                }
            })
            .collect())
    }

    /// Install if needed, then start a module
    pub async fn run(&self, path: &str) -> Result<ModuleDescriptor, ModuleError> {
        let descriptor = self.registry.require(path).await?;
        if self.supervisor.is_running(&descriptor.name).await {
            return Err(ModuleError::AlreadyRunning(descriptor.name));
        }
        let descriptor = self.installer.install(path).await?;
        let storage = self.registry.storage_path(&descriptor);
        let manifest = ModuleManifest::from_dir(&storage).await?;
        let spec = LaunchSpec::new(&descriptor, storage, &manifest)?;
        self.supervisor.run(descriptor, spec).await
    }

    /// Stop a running module
    pub async fn kill(&self, path: &str) -> Result<ModuleDescriptor, ModuleError> {
        let name = self.running_name(path).await?;
        self.supervisor.kill(&name).await
    }

    /// Captured output of a module: the live buffer, else its log file, else empty
    pub async fn output(&self, path: &str) -> Result<String, ModuleError> {
        let name = match self.running_name(path).await {
            Ok(name) => name,
            Err(_) => self.registry.require(path).await?.name,
        };
        if let Some(text) = self.supervisor.output(&name).await {
            return Ok(text);
        }
        let log = self.logs_dir.join(format!("{}.log", name));
        match tokio::fs::read_to_string(&log).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish a host procedure callable by modules as `core.<name>`
    pub async fn core_expose(&self, name: &str, procedure: Arc<dyn Procedure>) {
        self.core.expose(name, procedure).await;
    }

    pub async fn core_remove(&self, name: &str) -> bool {
        self.core.remove(name).await
    }

    /// Call a procedure on a module (or on the host itself)
    pub async fn core_call(
        &self,
        destination: &str,
        procedure: &str,
        args: Value,
    ) -> Result<Value, RpcError> {
        self.core.call(destination, procedure, args).await
    }

    /// Emit an event from the host
    pub fn core_emit(&self, event_type: &str, payload: Value) {
        self.core.emit(event_type, payload);
    }

    /// Kill every running module
    pub async fn shutdown(&self) {
        info!("Shutting down module manager");
        self.supervisor.shutdown().await;
    }

    /// Module name for a registered path, or for a path a running module was started from
    async fn running_name(&self, path: &str) -> Result<String, ModuleError> {
        if let Some(descriptor) = self.registry.get(path).await? {
            return Ok(descriptor.name);
        }
        self.supervisor
            .table()
            .lock()
            .await
            .values()
            .find(|entry| entry.descriptor.path == path)
            .map(|entry| entry.descriptor.name.clone())
            .ok_or_else(|| ModuleError::ModuleUnknown(path.to_string()))
    }
}

impl Drop for ModuleManager {
    fn drop(&mut self) {
        self.hub_task.abort();
    }
}

#[cfg(feature = "http-source")]
fn default_source(config: &HostConfig) -> Result<Arc<dyn RemoteSource>, ModuleError> {
    use crate::module::registry::source::HttpSource;
    Ok(Arc::new(HttpSource::new(config.remote.clone())?))
}

#[cfg(not(feature = "http-source"))]
fn default_source(_config: &HostConfig) -> Result<Arc<dyn RemoteSource>, ModuleError> {
    use crate::module::registry::source::NoRemoteSource;
    tracing::warn!("Built without http-source, remote modules cannot be fetched");
    Ok(Arc::new(NoRemoteSource))
}
