//! Virtual host endpoint
//!
//! The in-process participant addressed as `core` on the bus. It owns the
//! table of host-provided procedures and the table of calls the host has
//! issued and not yet seen a reply for.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn};

use crate::module::api::hub::HubHandle;
use crate::module::ipc::protocol::{Body, Envelope, MessageId, RpcError, HOST_ENDPOINT};

/// A procedure callable over the bus
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Run the procedure for `caller`
    async fn call(&self, caller: &str, args: Value) -> Result<Value, RpcError>;
}

#[async_trait]
impl<F, Fut> Procedure for F
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn call(&self, caller: &str, args: Value) -> Result<Value, RpcError> {
        (self)(caller.to_string(), args).await
    }
}

type PendingReply = oneshot::Sender<Result<Value, RpcError>>;

pub struct HostEndpoint {
    procedures: RwLock<HashMap<String, Arc<dyn Procedure>>>,
    pending: Mutex<HashMap<MessageId, PendingReply>>,
    next_id: AtomicU64,
    hub: HubHandle,
}

impl HostEndpoint {
    pub fn new(hub: HubHandle) -> Self {
        Self {
            procedures: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            hub,
        }
    }

    /// Next id in the host's message id sequence
    pub fn next_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish a procedure. An existing procedure with the same name is replaced.
    pub async fn expose(&self, name: impl Into<String>, procedure: Arc<dyn Procedure>) {
        let name = name.into();
        debug!("Host exposing procedure {}", name);
        self.procedures.write().await.insert(name, procedure);
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.procedures.write().await.remove(name).is_some()
    }

    pub async fn procedure(&self, name: &str) -> Option<Arc<dyn Procedure>> {
        self.procedures.read().await.get(name).cloned()
    }

    /// Call `procedure` on `destination` and wait for its reply
    ///
    /// No timeout is applied; the call ends with the reply or with a
    /// "module restarting"/"not running" error synthesized by the dispatcher.
    pub async fn call(
        &self,
        destination: &str,
        procedure: &str,
        args: Value,
    ) -> Result<Value, RpcError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let envelope = Envelope::new(
            HOST_ENDPOINT,
            id,
            Body::RpcCall {
                destination: destination.to_string(),
                procedure: procedure.to_string(),
                args,
            },
        );
        if !self.hub.deliver(HOST_ENDPOINT, envelope) {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::failed("dispatcher stopped"));
        }

        rx.await
            .unwrap_or_else(|_| Err(RpcError::failed("dispatcher stopped")))
    }

    /// Send a call without waiting for, or tracking, its reply
    pub fn cast(&self, destination: &str, procedure: &str, args: Value) {
        let envelope = Envelope::new(
            HOST_ENDPOINT,
            self.next_id(),
            Body::RpcCall {
                destination: destination.to_string(),
                procedure: procedure.to_string(),
                args,
            },
        );
        if !self.hub.deliver(HOST_ENDPOINT, envelope) {
            warn!("Dropping call {} to {}: dispatcher stopped", procedure, destination);
        }
    }

    /// Number of host calls still waiting for a reply
    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Publish an event from the host
    pub fn emit(&self, event_type: &str, payload: Value) {
        let envelope = Envelope::new(
            HOST_ENDPOINT,
            self.next_id(),
            Body::Event {
                event_type: event_type.to_string(),
                payload,
            },
        );
        if !self.hub.deliver(HOST_ENDPOINT, envelope) {
            warn!("Dropping host event {}: dispatcher stopped", event_type);
        }
    }

    /// Complete an outstanding host call
    pub async fn resolve(&self, reply_to: MessageId, result: Result<Value, RpcError>) {
        match self.pending.lock().await.remove(&reply_to) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("Host got reply to unknown call {}", reply_to),
        }
    }

    /// Serve a call addressed to the host
    ///
    /// The reply re-enters the dispatcher as a fresh envelope. Handlers run
    /// in their own task so the dispatcher never waits on them.
    pub async fn serve(self: &Arc<Self>, call: Envelope) {
        let (procedure, args) = match &call.body {
            Body::RpcCall {
                procedure, args, ..
            } => (procedure.clone(), args.clone()),
            _ => return,
        };

        let Some(handler) = self.procedure(&procedure).await else {
            debug!("Host procedure {} not found (caller {})", procedure, call.sender());
            let reply = Envelope::reply_to(
                &call,
                HOST_ENDPOINT,
                self.next_id(),
                Err(RpcError::procedure_not_found(&procedure)),
            );
            self.hub.deliver(HOST_ENDPOINT, reply);
            return;
        };

        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let result = handler.call(call.sender(), args).await;
            let reply = Envelope::reply_to(&call, HOST_ENDPOINT, endpoint.next_id(), result);
            endpoint.hub.deliver(HOST_ENDPOINT, reply);
        });
    }
}
