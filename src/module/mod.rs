//! Module system
//!
//! Modules are independently versioned programs run as separate processes.
//! The host registers them from remote or local sources, installs their code,
//! supervises their processes, and routes calls and events between them and
//! itself over a single bus.
//!
//! ## Architecture
//!
//! - **Registry**: identifiers resolve to canonical paths; the registered set is
//!   folded from an append-only oplog
//! - **Installer**: one materialization pipeline per path, shared by concurrent callers
//! - **Supervisor**: bounded automatic restarts, graceful then forced termination
//! - **Bus**: `register`/`unregister`/`event`/`rpc_call`/`rpc_reply` envelopes routed
//!   between module processes and the in-process host endpoint (`core`)
//! - **Client**: the module-side peer of the bus

pub mod api;
pub mod client;
pub mod installer;
pub mod ipc;
pub mod manager;
pub mod process;
pub mod registry;
pub mod traits;

pub use client::{ModuleClient, ModuleEvent, RemoteModule};
pub use manager::ModuleManager;
pub use traits::{
    InstallStatus, ManagerEvent, ModuleDescriptor, ModuleError, ModuleState, ModuleView,
};
