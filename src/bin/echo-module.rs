//! Example module for modhost
//!
//! Demonstrates:
//! - Exposing procedures to the host and other modules
//! - Calling the host
//! - Subscribing to and emitting events
//!
//! Procedures: `echo` returns its arguments, `host_version` asks `core` for
//! `version`, `announce` emits an `announced` event, `last_event` returns the
//! last event seen from the followed module. Every `ping` event from `core`
//! is answered with a `pong` event.
//!
//! Usage (as a manifest entry point):
//!   echo-module [--follow <module>]

use clap::Parser;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use module_host::module::client::ModuleClient;
use module_host::module::ipc::RpcError;
use module_host::utils::init_module_logging;

#[derive(Parser, Debug)]
struct Args {
    /// Subscribe to every event of this module
    #[arg(long)]
    follow: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let client = ModuleClient::from_stdio()?;
    init_module_logging(client.name(), None);
    info!("Echo module {} starting", client.name());

    client
        .expose(
            "echo",
            Arc::new(|_caller: String, args: Value| async move { Ok::<Value, RpcError>(args) }),
        )
        .await;

    let core = client.module("core").await;
    let host = core.clone();
    client
        .expose(
            "host_version",
            Arc::new(move |_caller: String, _args: Value| {
                let host = host.clone();
                async move { host.call("version", Value::Null).await }
            }),
        )
        .await;

    let emitter = client.clone();
    client
        .expose(
            "announce",
            Arc::new(move |_caller: String, args: Value| {
                let emitter = emitter.clone();
                async move {
                    emitter
                        .emit("announced", args)
                        .map_err(|e| RpcError::failed(e.to_string()))?;
                    Ok::<Value, RpcError>(Value::Null)
                }
            }),
        )
        .await;

    let last_event = Arc::new(Mutex::new(Value::Null));
    let seen = Arc::clone(&last_event);
    client
        .expose(
            "last_event",
            Arc::new(move |_caller: String, _args: Value| {
                let seen = Arc::clone(&seen);
                async move { Ok::<Value, RpcError>(seen.lock().await.clone()) }
            }),
        )
        .await;

    let mut pings = core.events();
    let followed = match &args.follow {
        Some(name) => Some(client.module(name).await),
        None => None,
    };
    let mut followed_events = followed.as_ref().map(|m| m.events());

    let reader = client.start(tokio::io::stdin());
    core.register("ping")?;
    if let Some(module) = &followed {
        module.register("*")?;
        info!("Following events of {}", module.name());
    }

    let ponger = client.clone();
    tokio::spawn(async move {
        while let Ok(event) = pings.recv().await {
            if event.event_type != "ping" {
                continue;
            }
            if let Err(e) = ponger.emit("pong", event.payload) {
                warn!("Failed to answer ping: {}", e);
            }
        }
    });

    if let Some(mut events) = followed_events.take() {
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                *last_event.lock().await = json!({
                    "source": event.source,
                    "event_type": event.event_type,
                    "payload": event.payload,
                });
            }
        });
    }

    reader.await?;
    info!("Echo module exiting");
    Ok(())
}
