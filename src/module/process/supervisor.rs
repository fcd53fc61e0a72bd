//! Process supervisor
//!
//! Owns the running-module table and drives each module through
//! `starting -> running`, bounded restarts after unexpected exits, and
//! `stopping` on kill. `run`, `kill` and exit handling for one module are
//! serialized by a per-module lock.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ModulesConfig;
use crate::module::api::events::SubscriptionSet;
use crate::module::api::host::HostEndpoint;
use crate::module::api::hub::HubHandle;
use crate::module::ipc::channel::{spawn_writer, EnvelopeReader};
use crate::module::ipc::protocol::{Body, Envelope, MessageId, RpcError, HOST_ENDPOINT};
use crate::module::process::monitor::{self, ExitNotice, ProcessControl};
use crate::module::process::output::{spawn_capture, OutputLog};
use crate::module::process::spawner::{self, LaunchSpec};
use crate::module::traits::{ManagerEvent, ModuleDescriptor, ModuleError, ModuleState};

/// One managed module
#[derive(Debug)]
pub struct RunningModule {
    pub descriptor: ModuleDescriptor,
    pub state: ModuleState,
    /// Channel into the live process; `None` between an exit and the next launch
    pub outbox: Option<mpsc::UnboundedSender<Envelope>>,
    pub subscriptions: SubscriptionSet,
    /// `(caller, call id)` of calls forwarded to the live process and not yet answered
    pub in_flight: HashSet<(String, MessageId)>,
    /// Automatic restarts performed so far
    pub restarts: u32,
    pub need_restart: bool,
    /// Incremented on every launch; exit notices from older launches are ignored
    pub generation: u64,
    spec: Option<Arc<LaunchSpec>>,
    control: Option<ProcessControl>,
}

impl RunningModule {
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor,
            state: ModuleState::Starting,
            outbox: None,
            subscriptions: SubscriptionSet::new(),
            in_flight: HashSet::new(),
            restarts: 0,
            need_restart: false,
            generation: 0,
            spec: None,
            control: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.as_ref().and_then(ProcessControl::pid)
    }
}

/// Module name -> running entry
pub type RunningTable = Arc<Mutex<HashMap<String, RunningModule>>>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub restart_cap: u32,
    pub kill_grace: Duration,
    pub logs_dir: PathBuf,
    pub private_output: bool,
    pub output_buffer_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&ModulesConfig::default())
    }
}

impl From<&ModulesConfig> for SupervisorConfig {
    fn from(config: &ModulesConfig) -> Self {
        Self {
            restart_cap: config.restart_cap,
            kill_grace: config.kill_grace(),
            logs_dir: config.logs_dir.clone(),
            private_output: config.private_output,
            output_buffer_lines: config.output_buffer_lines,
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    table: RunningTable,
    core: Arc<HostEndpoint>,
    hub: HubHandle,
    events: broadcast::Sender<ManagerEvent>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    outputs: Mutex<HashMap<String, Arc<OutputLog>>>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
}

impl Supervisor {
    /// Create the supervisor and its exit-handling task
    pub fn new(
        config: SupervisorConfig,
        table: RunningTable,
        core: Arc<HostEndpoint>,
        hub: HubHandle,
        events: broadcast::Sender<ManagerEvent>,
    ) -> Arc<Self> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<ExitNotice>();
        let supervisor = Arc::new(Self {
            config,
            table,
            core,
            hub,
            events,
            locks: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            exit_tx,
        });

        let weak: Weak<Self> = Arc::downgrade(&supervisor);
        tokio::spawn(async move {
            while let Some(notice) = exit_rx.recv().await {
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move { supervisor.handle_exit(notice).await });
            }
        });

        supervisor
    }

    pub fn table(&self) -> &RunningTable {
        &self.table
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn notify(&self, descriptor: ModuleDescriptor) {
        let _ = self.events.send(ManagerEvent::StateChange(descriptor));
    }

    /// Answer calls the exited process will never reply to
    fn fail_calls(&self, name: &str, calls: HashSet<(String, MessageId)>, error: RpcError) {
        if !calls.is_empty() {
            debug!("Failing {} unanswered calls to {}", calls.len(), name);
        }
        for (caller, id) in calls {
            let reply = Envelope::new(
                HOST_ENDPOINT,
                self.core.next_id(),
                Body::RpcReply {
                    destination: caller,
                    reply_to: id,
                    result: Err(error.clone()),
                },
            );
            self.hub.deliver(HOST_ENDPOINT, reply);
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.table.lock().await.contains_key(name)
    }

    /// Start a module whose code is installed at `spec.storage`
    pub async fn run(
        &self,
        descriptor: ModuleDescriptor,
        spec: LaunchSpec,
    ) -> Result<ModuleDescriptor, ModuleError> {
        let name = descriptor.name.clone();
        let lock = self.lock_for(&name).await;
        let _guard = lock.lock().await;

        {
            let mut table = self.table.lock().await;
            if table.contains_key(&name) {
                return Err(ModuleError::AlreadyRunning(name));
            }
            let mut entry = RunningModule::new(descriptor.clone());
            entry.spec = Some(Arc::new(spec));
            table.insert(name.clone(), entry);
        }

        if let Err(e) = self.launch(&name).await {
            self.table.lock().await.remove(&name);
            return Err(e);
        }

        info!("Module {} started ({})", name, descriptor.path);
        self.notify(descriptor.clone());
        Ok(descriptor)
    }

    /// Stop a module: best-effort `kill` call, grace period, forced termination
    pub async fn kill(&self, name: &str) -> Result<ModuleDescriptor, ModuleError> {
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        let (descriptor, control, reachable) = {
            let mut table = self.table.lock().await;
            let entry = table
                .get_mut(name)
                .ok_or_else(|| ModuleError::NotRunning(name.to_string()))?;
            entry.state = ModuleState::Stopping;
            (
                entry.descriptor.clone(),
                entry.control.take(),
                entry.outbox.is_some(),
            )
        };
        self.notify(descriptor.clone());

        if reachable {
            // Fire and forget: the process may exit before it can reply
            self.core.cast(name, "kill", serde_json::Value::Null);
        }

        if let Some(control) = control {
            let status = control.stop(self.config.kill_grace).await;
            debug!("Module {} exit status {:?}", name, status);
        }

        let removed = self.table.lock().await.remove(name);
        if let Some(entry) = removed {
            self.fail_calls(name, entry.in_flight, RpcError::module_not_running(name));
        }
        info!("Module {} killed", name);
        self.notify(descriptor.clone());
        Ok(descriptor)
    }

    /// Kill every managed module
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.table.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.kill(&name).await {
                debug!("Module {} already gone at shutdown: {}", name, e);
            }
        }
    }

    /// Captured output for a module name, if any launch happened
    pub async fn output(&self, name: &str) -> Option<String> {
        let log = self.outputs.lock().await.get(name).cloned()?;
        Some(log.text().await)
    }

    async fn output_log(&self, name: &str) -> Arc<OutputLog> {
        let mut outputs = self.outputs.lock().await;
        outputs
            .entry(name.to_string())
            .or_insert_with(|| {
                let file = if self.config.private_output {
                    None
                } else {
                    Some(self.config.logs_dir.join(format!("{}.log", name)))
                };
                Arc::new(OutputLog::new(self.config.output_buffer_lines, file))
            })
            .clone()
    }

    /// Spawn a process for an existing entry and wire it to the bus
    ///
    /// Callers hold the module's lock.
    async fn launch(&self, name: &str) -> Result<(), ModuleError> {
        let (spec, generation) = {
            let table = self.table.lock().await;
            let entry = table
                .get(name)
                .ok_or_else(|| ModuleError::NotRunning(name.to_string()))?;
            let spec = entry
                .spec
                .clone()
                .ok_or_else(|| ModuleError::SpawnFailed(format!("no launch spec for {}", name)))?;
            (spec, entry.generation + 1)
        };

        let process = spawner::spawn(&spec)?;
        debug!(
            "Module {} launch {} pid {:?} instance {}",
            name,
            generation,
            process.id(),
            process.instance
        );

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        spawn_writer(process.stdin, outbox_rx, name);

        let hub = self.hub.clone();
        let reader_name = name.to_string();
        let stdout = process.stdout;
        tokio::spawn(async move {
            let mut reader = EnvelopeReader::new(stdout, reader_name.clone());
            while let Some(envelope) = reader.next().await {
                if !hub.deliver(&reader_name, envelope) {
                    break;
                }
            }
            debug!("Channel from module {} closed", reader_name);
        });

        spawn_capture(name.to_string(), process.stderr, self.output_log(name).await);

        let control = monitor::watch(
            name.to_string(),
            generation,
            process.child,
            self.exit_tx.clone(),
        );

        let mut table = self.table.lock().await;
        match table.get_mut(name) {
            Some(entry) => {
                entry.generation = generation;
                entry.state = ModuleState::Starting;
                entry.outbox = Some(outbox);
                entry.control = Some(control);
                Ok(())
            }
            None => {
                drop(table);
                control.stop(Duration::ZERO).await;
                Err(ModuleError::NotRunning(name.to_string()))
            }
        }
    }

    async fn handle_exit(&self, notice: ExitNotice) {
        let name = notice.name;
        let lock = self.lock_for(&name).await;
        let _guard = lock.lock().await;

        loop {
            let descriptor = {
                let mut table = self.table.lock().await;
                let Some(entry) = table.get_mut(&name) else {
                    return;
                };
                if entry.generation != notice.generation || entry.state == ModuleState::Stopping {
                    debug!("Ignoring stale exit of module {}", name);
                    return;
                }

                entry.outbox = None;
                entry.control = None;
                entry.subscriptions.clear();
                let orphaned = std::mem::take(&mut entry.in_flight);

                if entry.restarts >= self.config.restart_cap {
                    let descriptor = entry.descriptor.clone();
                    table.remove(&name);
                    self.fail_calls(&name, orphaned, RpcError::module_not_running(&name));
                    error!(
                        "Module {} exceeded {} restarts, no longer managed",
                        name, self.config.restart_cap
                    );
                    drop(table);
                    self.notify(descriptor);
                    return;
                }

                entry.restarts += 1;
                entry.state = ModuleState::Restarting;
                self.fail_calls(&name, orphaned, RpcError::module_restarting(&name));
                info!(
                    "Restarting module {} (attempt {}/{})",
                    name, entry.restarts, self.config.restart_cap
                );
                entry.descriptor.clone()
            };
            self.notify(descriptor.clone());

            match self.launch(&name).await {
                Ok(()) => {
                    self.notify(descriptor);
                    return;
                }
                Err(e) => warn!("Module {} restart failed: {}", name, e),
            }
        }
    }
}
