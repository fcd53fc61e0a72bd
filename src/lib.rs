//! Module Host - process-isolated modules on a shared bus
//!
//! This crate lets a host application load independently versioned modules
//! as separate processes and lets those processes (and the host itself) call
//! each other's procedures and exchange events.
//!
//! ## Design Principles
//!
//! 1. **Process Isolation**: each module runs in its own process; a crash is
//!    contained and recovered by bounded restarts
//! 2. **One Bus**: modules and the host are peers addressed by name
//! 3. **Owned State**: every path's registry, installation and process state
//!    sits behind a single serialization point

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod module;
pub mod utils;

pub use config::{HostConfig, LoggingConfig, ModulesConfig, RemoteConfig};
pub use module::{
    ManagerEvent, ModuleClient, ModuleDescriptor, ModuleError, ModuleManager, ModuleView,
};
