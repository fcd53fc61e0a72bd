//! Module-side client library
//!
//! Runs inside a module process and speaks the bus protocol over the
//! process's stdin/stdout. A module exposes procedures, obtains proxies for
//! other modules (or the host, addressed as `core`), subscribes to events
//! and emits its own.
//!
//! ```no_run
//! use module_host::module::client::ModuleClient;
//! use module_host::module::ipc::RpcError;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ModuleClient::from_stdio()?;
//! client
//!     .expose("ping", Arc::new(|_caller: String, _args: Value| async move {
//!         Ok::<Value, RpcError>(json!("pong"))
//!     }))
//!     .await;
//! let reader = client.start(tokio::io::stdin());
//! let answer = client.module("core").await.call("version", Value::Null).await?;
//! # reader.await?;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::module::api::host::Procedure;
use crate::module::ipc::channel::{spawn_writer, EnvelopeReader};
use crate::module::ipc::protocol::{
    Body, Envelope, MessageId, RpcError, RpcErrorKind, HOST_ENDPOINT, WILDCARD,
};
use crate::module::process::spawner::ENV_MODULE_NAME;
use crate::module::traits::ModuleError;

/// Delay between answering `kill` and exiting, so the reply can be flushed
const KILL_EXIT_DELAY: Duration = Duration::from_millis(100);

const PROXY_EVENT_CAPACITY: usize = 256;

/// An event received from the bus
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleEvent {
    pub source: String,
    pub event_type: String,
    pub payload: Value,
}

struct Inner {
    name: String,
    next_id: AtomicU64,
    outbox: mpsc::UnboundedSender<Envelope>,
    procedures: RwLock<HashMap<String, Arc<dyn Procedure>>>,
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Result<Value, RpcError>>>>,
    proxies: Mutex<HashMap<String, broadcast::Sender<ModuleEvent>>>,
}

impl Inner {
    fn next_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, body: Body) -> Result<MessageId, ModuleError> {
        let id = self.next_id();
        self.outbox
            .send(Envelope::new(self.name.clone(), id, body))
            .map_err(|_| ModuleError::IpcError("channel to host closed".to_string()))?;
        Ok(id)
    }

    async fn call(&self, destination: &str, procedure: &str, args: Value) -> Result<Value, RpcError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let envelope = Envelope::new(
            self.name.clone(),
            id,
            Body::RpcCall {
                destination: destination.to_string(),
                procedure: procedure.to_string(),
                args,
            },
        );
        if self.outbox.send(envelope).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::failed("channel to host closed"));
        }
        rx.await
            .unwrap_or_else(|_| Err(RpcError::failed("channel to host closed")))
    }
}

/// Connection of a module process to the bus
#[derive(Clone)]
pub struct ModuleClient {
    inner: Arc<Inner>,
}

impl ModuleClient {
    /// Create a client writing to `writer`, with default `init` and `kill` procedures
    pub fn new<W>(name: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        spawn_writer(writer, outbox_rx, HOST_ENDPOINT);

        let mut procedures: HashMap<String, Arc<dyn Procedure>> = HashMap::new();
        procedures.insert(
            "init".to_string(),
            Arc::new(|_caller: String, _args: Value| async move {
                Ok::<Value, RpcError>(Value::Null)
            }),
        );
        procedures.insert(
            "kill".to_string(),
            Arc::new(|_caller: String, _args: Value| async move {
                tokio::spawn(async {
                    tokio::time::sleep(KILL_EXIT_DELAY).await;
                    std::process::exit(0);
                });
                Ok::<Value, RpcError>(Value::Null)
            }),
        );

        Self {
            inner: Arc::new(Inner {
                name,
                next_id: AtomicU64::new(1),
                outbox,
                procedures: RwLock::new(procedures),
                pending: Mutex::new(HashMap::new()),
                proxies: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Client for a process launched by the host: name from the environment, stdout as channel
    pub fn from_stdio() -> Result<Self, ModuleError> {
        let name = std::env::var(ENV_MODULE_NAME).map_err(|_| {
            ModuleError::OperationError(format!("{} is not set", ENV_MODULE_NAME))
        })?;
        Ok(Self::new(name, tokio::io::stdout()))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn the reader loop on `reader`, then announce readiness
    ///
    /// Procedures exposed before this call are in place when `init` arrives.
    pub fn start<R>(&self, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut reader = EnvelopeReader::new(reader, HOST_ENDPOINT);
            while let Some(envelope) = reader.next().await {
                handle_inbound(&inner, envelope).await;
            }
            info!("Module {} lost its host channel", inner.name);
            for (_, waiter) in inner.pending.lock().await.drain() {
                let _ = waiter.send(Err(RpcError::failed("channel to host closed")));
            }
        });

        if let Err(e) = self.inner.send(Body::Ready) {
            warn!("Module {} could not announce readiness: {}", self.inner.name, e);
        }
        handle
    }

    /// Publish a procedure, replacing any with the same name
    pub async fn expose(&self, name: impl Into<String>, procedure: Arc<dyn Procedure>) {
        self.inner
            .procedures
            .write()
            .await
            .insert(name.into(), procedure);
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.inner.procedures.write().await.remove(name).is_some()
    }

    /// Proxy for one module (or the host as `core`), or every sender as `*`
    pub async fn module(&self, name: &str) -> RemoteModule {
        let events = self
            .inner
            .proxies
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(PROXY_EVENT_CAPACITY).0)
            .clone();
        RemoteModule {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
            events,
        }
    }

    /// Subscribe to events; returns the registration id
    pub fn register(&self, source: &str, event_type: &str) -> Result<MessageId, ModuleError> {
        self.inner.send(Body::Register {
            source: source.to_string(),
            event_type: event_type.to_string(),
        })
    }

    pub fn unregister(&self, registration: MessageId) -> Result<(), ModuleError> {
        self.inner.send(Body::Unregister { registration }).map(|_| ())
    }

    pub fn emit(&self, event_type: &str, payload: Value) -> Result<(), ModuleError> {
        self.inner
            .send(Body::Event {
                event_type: event_type.to_string(),
                payload,
            })
            .map(|_| ())
    }
}

/// Proxy scoped to one remote identity
#[derive(Clone)]
pub struct RemoteModule {
    name: String,
    inner: Arc<Inner>,
    events: broadcast::Sender<ModuleEvent>,
}

impl RemoteModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call a procedure on this module. Not allowed on the wildcard proxy.
    pub async fn call(&self, procedure: &str, args: Value) -> Result<Value, RpcError> {
        if self.name == WILDCARD {
            return Err(RpcError::new(
                RpcErrorKind::Disallowed,
                "cannot call through the wildcard proxy",
            ));
        }
        self.inner.call(&self.name, procedure, args).await
    }

    /// Events from this identity that reached this module
    pub fn events(&self) -> broadcast::Receiver<ModuleEvent> {
        self.events.subscribe()
    }

    /// Subscribe to `event_type` events from this identity
    pub fn register(&self, event_type: &str) -> Result<MessageId, ModuleError> {
        self.inner.send(Body::Register {
            source: self.name.clone(),
            event_type: event_type.to_string(),
        })
    }
}

async fn handle_inbound(inner: &Arc<Inner>, envelope: Envelope) {
    match &envelope.body {
        Body::RpcCall {
            destination,
            procedure,
            args,
        } => {
            if destination != &inner.name {
                debug!("Ignoring call addressed to {}", destination);
                return;
            }
            let handler = inner.procedures.read().await.get(procedure).cloned();
            let Some(handler) = handler else {
                let reply = Envelope::reply_to(
                    &envelope,
                    inner.name.clone(),
                    inner.next_id(),
                    Err(RpcError::procedure_not_found(procedure)),
                );
                let _ = inner.outbox.send(reply);
                return;
            };

            let inner = Arc::clone(inner);
            let args = args.clone();
            tokio::spawn(async move {
                let result = handler.call(envelope.sender(), args).await;
                let reply = Envelope::reply_to(&envelope, inner.name.clone(), inner.next_id(), result);
                let _ = inner.outbox.send(reply);
            });
        }
        Body::RpcReply {
            reply_to, result, ..
        } => match inner.pending.lock().await.remove(reply_to) {
            Some(waiter) => {
                let _ = waiter.send(result.clone());
            }
            None => debug!("Reply to unknown call {}", reply_to),
        },
        Body::Event {
            event_type,
            payload,
        } => {
            let event = ModuleEvent {
                source: envelope.sender().to_string(),
                event_type: event_type.clone(),
                payload: payload.clone(),
            };
            let proxies = inner.proxies.lock().await;
            for key in [event.source.as_str(), WILDCARD] {
                if let Some(proxy) = proxies.get(key) {
                    let _ = proxy.send(event.clone());
                }
            }
        }
        Body::Register { .. } | Body::Unregister { .. } | Body::Ready => {
            debug!("Ignoring {} from host", envelope.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Host end of a duplex channel
    struct Host {
        reader: EnvelopeReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        writer: mpsc::UnboundedSender<Envelope>,
    }

    impl Host {
        async fn recv(&mut self) -> Envelope {
            self.reader.next().await.unwrap()
        }

        fn send(&self, envelope: Envelope) {
            self.writer.send(envelope).unwrap();
        }
    }

    fn connect(client_setup: impl FnOnce(&ModuleClient)) -> (ModuleClient, Host) {
        let (module_end, host_end) = tokio::io::duplex(64 * 1024);
        let (module_read, module_write) = tokio::io::split(module_end);
        let (host_read, host_write) = tokio::io::split(host_end);

        let client = ModuleClient::new("widget", module_write);
        client_setup(&client);
        client.start(module_read);

        let (writer, rx) = mpsc::unbounded_channel();
        spawn_writer(host_write, rx, "widget");
        let host = Host {
            reader: EnvelopeReader::new(host_read, "widget"),
            writer,
        };
        (client, host)
    }

    fn call(id: u64, procedure: &str, args: Value) -> Envelope {
        Envelope::new(
            HOST_ENDPOINT,
            id,
            Body::RpcCall {
                destination: "widget".to_string(),
                procedure: procedure.to_string(),
                args,
            },
        )
    }

    fn reply_result(envelope: Envelope, expected_reply_to: u64) -> Result<Value, RpcError> {
        match envelope.body {
            Body::RpcReply {
                reply_to, result, ..
            } => {
                assert_eq!(reply_to, expected_reply_to);
                result
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_then_default_init() {
        let (_client, mut host) = connect(|_| {});

        let ready = host.recv().await;
        assert_eq!(ready.sender(), "widget");
        assert_eq!(ready.body, Body::Ready);

        host.send(call(1, "init", Value::Null));
        assert_eq!(reply_result(host.recv().await, 1), Ok(Value::Null));
    }

    #[tokio::test]
    async fn test_unknown_procedure() {
        let (_client, mut host) = connect(|_| {});
        host.recv().await;

        host.send(call(2, "missing", Value::Null));
        let error = reply_result(host.recv().await, 2).unwrap_err();
        assert_eq!(error.kind, RpcErrorKind::ProcedureNotFound);
    }

    #[tokio::test]
    async fn test_exposed_procedure() {
        let (client, mut host) = connect(|_| {});
        host.recv().await;
        client
            .expose(
                "sum",
                Arc::new(|_caller: String, args: Value| async move {
                    let total: i64 = args
                        .as_array()
                        .map(|a| a.iter().filter_map(Value::as_i64).sum())
                        .unwrap_or(0);
                    Ok::<Value, RpcError>(json!(total))
                }),
            )
            .await;

        host.send(call(3, "sum", json!([1, 2, 3])));
        assert_eq!(reply_result(host.recv().await, 3), Ok(json!(6)));

        assert!(client.remove("sum").await);
        host.send(call(4, "sum", json!([1])));
        assert!(reply_result(host.recv().await, 4).is_err());
    }

    #[tokio::test]
    async fn test_proxy_call_roundtrip() {
        let (client, mut host) = connect(|_| {});
        host.recv().await;

        let gadget = client.module("gadget").await;
        let pending = tokio::spawn(async move { gadget.call("ping", json!(1)).await });

        let outgoing = host.recv().await;
        match &outgoing.body {
            Body::RpcCall {
                destination,
                procedure,
                ..
            } => {
                assert_eq!(destination, "gadget");
                assert_eq!(procedure, "ping");
            }
            other => panic!("unexpected body {:?}", other),
        }
        host.send(Envelope::reply_to(&outgoing, "gadget", 1, Ok(json!("pong"))));

        assert_eq!(pending.await.unwrap(), Ok(json!("pong")));
    }

    #[tokio::test]
    async fn test_wildcard_proxy_cannot_call() {
        let (client, _host) = connect(|_| {});
        let everyone = client.module(WILDCARD).await;
        let error = everyone.call("ping", Value::Null).await.unwrap_err();
        assert_eq!(error.kind, RpcErrorKind::Disallowed);
    }

    #[tokio::test]
    async fn test_events_reach_named_and_wildcard_proxies() {
        let (client, mut host) = connect(|_| {});
        host.recv().await;
        let mut from_gadget = client.module("gadget").await.events();
        let mut from_anyone = client.module(WILDCARD).await.events();
        let mut from_core = client.module(HOST_ENDPOINT).await.events();

        host.send(Envelope::new(
            "gadget",
            9,
            Body::Event {
                event_type: "tick".to_string(),
                payload: json!(42),
            },
        ));

        let event = from_gadget.recv().await.unwrap();
        assert_eq!(event.source, "gadget");
        assert_eq!(event.payload, json!(42));
        assert_eq!(from_anyone.recv().await.unwrap(), event);
        assert!(from_core.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_and_emit() {
        let (client, mut host) = connect(|_| {});
        host.recv().await;

        let registration = client.register(HOST_ENDPOINT, "tick").unwrap();
        client.emit("tock", json!(null)).unwrap();
        client.unregister(registration).unwrap();

        let register = host.recv().await;
        assert_eq!(register.id(), registration);
        assert!(matches!(register.body, Body::Register { .. }));
        assert!(matches!(host.recv().await.body, Body::Event { .. }));
        assert_eq!(
            host.recv().await.body,
            Body::Unregister { registration }
        );
    }

    #[tokio::test]
    async fn test_init_override_before_start() {
        let (module_end, host_end) = tokio::io::duplex(64 * 1024);
        let (module_read, module_write) = tokio::io::split(module_end);
        let (host_read, host_write) = tokio::io::split(host_end);
        let client = ModuleClient::new("widget", module_write);
        client
            .expose(
                "init",
                Arc::new(|caller: String, _args: Value| async move {
                    Ok::<Value, RpcError>(json!({ "initialized_by": caller }))
                }),
            )
            .await;
        client.start(module_read);

        let (writer, rx) = mpsc::unbounded_channel();
        spawn_writer(host_write, rx, "widget");
        let mut host = Host {
            reader: EnvelopeReader::new(host_read, "widget"),
            writer,
        };
        host.recv().await;
        host.send(call(1, "init", Value::Null));
        assert_eq!(
            reply_result(host.recv().await, 1),
            Ok(json!({ "initialized_by": "core" }))
        );
    }
}
