//! Message dispatcher
//!
//! Every envelope on the bus, whether read from a module's channel or
//! produced by the host endpoint, enters one queue and is routed by a single
//! task. Routing looks only at the envelope and the running-module table;
//! anything slow (host procedures, `init` calls) runs in its own task and
//! comes back through the queue.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::module::api::host::HostEndpoint;
use crate::module::ipc::protocol::{Body, Destination, Envelope, RpcError, HOST_ENDPOINT};
use crate::module::process::supervisor::RunningTable;
use crate::module::traits::{ManagerEvent, ModuleState};

/// An envelope together with the channel it arrived on
#[derive(Debug)]
pub struct Inbound {
    /// Module name of the channel, or the host endpoint name
    pub from: String,
    pub envelope: Envelope,
}

/// Sending side of the dispatcher queue
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl HubHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an envelope for routing. Returns false once the dispatcher is gone.
    pub fn deliver(&self, from: &str, envelope: Envelope) -> bool {
        self.tx
            .send(Inbound {
                from: from.to_string(),
                envelope,
            })
            .is_ok()
    }
}

pub struct MessageHub {
    table: RunningTable,
    core: Arc<HostEndpoint>,
    events: broadcast::Sender<ManagerEvent>,
    handle: HubHandle,
}

impl MessageHub {
    pub fn new(
        table: RunningTable,
        core: Arc<HostEndpoint>,
        events: broadcast::Sender<ManagerEvent>,
        handle: HubHandle,
    ) -> Self {
        Self {
            table,
            core,
            events,
            handle,
        }
    }

    /// Run the routing loop until the queue closes
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                self.dispatch(inbound).await;
            }
            debug!("Message hub stopped");
        })
    }

    /// Route one envelope
    pub async fn dispatch(&self, inbound: Inbound) {
        let Inbound { from, envelope } = inbound;
        if envelope.sender() != from {
            debug!(
                "Dropping {} from channel {} claiming sender {}",
                envelope.kind(),
                from,
                envelope.sender()
            );
            return;
        }

        match &envelope.body {
            Body::Ready => self.on_ready(&from).await,
            Body::Register { source, event_type } => {
                let mut table = self.table.lock().await;
                match table.get_mut(&from) {
                    Some(entry) => {
                        debug!("Module {} subscribed to {} from {}", from, event_type, source);
                        entry
                            .subscriptions
                            .register(envelope.id(), source, event_type);
                    }
                    None => debug!("Ignoring register from unmanaged sender {}", from),
                }
            }
            Body::Unregister { registration } => {
                let mut table = self.table.lock().await;
                if let Some(entry) = table.get_mut(&from) {
                    if !entry.subscriptions.unregister(*registration) {
                        debug!("Module {} has no registration {}", from, registration);
                    }
                }
            }
            Body::Event { event_type, .. } => {
                let table = self.table.lock().await;
                for (name, entry) in table.iter() {
                    if !entry.subscriptions.matches(&from, event_type) {
                        continue;
                    }
                    let Some(outbox) = entry.outbox.as_ref() else {
                        continue;
                    };
                    if outbox.send(envelope.clone()).is_err() {
                        warn!("Failed to deliver event {} to module {}", event_type, name);
                    }
                }
            }
            Body::RpcCall {
                destination,
                procedure,
                ..
            } => {
                let _ = self.events.send(ManagerEvent::RpcTrace {
                    source: from.clone(),
                    destination: destination.clone(),
                    procedure: procedure.clone(),
                });
                match Destination::parse(destination) {
                    Destination::Host => self.core.serve(envelope).await,
                    Destination::Module(name) => self.forward_call(&name, envelope).await,
                }
            }
            Body::RpcReply {
                destination,
                reply_to,
                result,
            } => {
                if let Some(entry) = self.table.lock().await.get_mut(&from) {
                    entry.in_flight.remove(&(destination.clone(), *reply_to));
                }
                match Destination::parse(destination) {
                    Destination::Host => self.core.resolve(*reply_to, result.clone()).await,
                    Destination::Module(name) => {
                        let table = self.table.lock().await;
                        let delivered = table
                            .get(&name)
                            .and_then(|entry| entry.outbox.as_ref())
                            .map(|outbox| outbox.send(envelope.clone()).is_ok())
                            .unwrap_or(false);
                        if !delivered {
                            debug!("Dropping reply {} for absent module {}", reply_to, name);
                        }
                    }
                }
            }
        }
    }

    async fn forward_call(&self, name: &str, call: Envelope) {
        let failure = {
            let mut table = self.table.lock().await;
            match table.get_mut(name) {
                Some(entry) => match entry.outbox.as_ref().map(|outbox| outbox.send(call.clone())) {
                    Some(Ok(())) => {
                        entry
                            .in_flight
                            .insert((call.sender().to_string(), call.id()));
                        None
                    }
                    // Channel closed: the process just exited
                    Some(Err(_)) => Some(RpcError::module_restarting(name)),
                    None if entry.state == ModuleState::Restarting => {
                        Some(RpcError::module_restarting(name))
                    }
                    None => Some(RpcError::module_not_running(name)),
                },
                None => Some(RpcError::module_not_running(name)),
            }
        };

        if let Some(error) = failure {
            debug!("Call to {} failed: {}", name, error);
            let reply = Envelope::reply_to(&call, HOST_ENDPOINT, self.core.next_id(), Err(error));
            self.handle.deliver(HOST_ENDPOINT, reply);
        }
    }

    async fn on_ready(&self, name: &str) {
        let descriptor = {
            let mut table = self.table.lock().await;
            match table.get_mut(name) {
                Some(entry) if entry.state == ModuleState::Starting => {
                    entry.state = ModuleState::Running;
                    entry.descriptor.clone()
                }
                Some(entry) => {
                    debug!("Module {} sent ready while {:?}", name, entry.state);
                    return;
                }
                None => return,
            }
        };

        info!("Module {} is ready", name);
        let _ = self.events.send(ManagerEvent::StateChange(descriptor));

        let core = Arc::clone(&self.core);
        let name = name.to_string();
        tokio::spawn(async move {
            match core.call(&name, "init", Value::Null).await {
                Ok(_) => debug!("Module {} initialized", name),
                Err(e) => warn!("Module {} init failed: {}", name, e),
            }
        });
    }
}
