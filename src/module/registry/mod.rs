//! Module registry
//!
//! Handles identifier resolution, remote sources, manifest parsing, and the
//! oplog-backed set of registered modules.

pub mod client;
pub mod manifest;
pub mod oplog;
pub mod path;
pub mod source;

pub use client::{RegistryClient, RegistrySnapshot};
pub use manifest::ModuleManifest;
pub use oplog::{FileOpLog, MemoryOpLog, OpLog, RegistryOp};
pub use path::{augment, expand, storage_path, ModuleSource, FLOATING_TAG};
#[cfg(feature = "http-source")]
pub use source::HttpSource;
pub use source::{NoRemoteSource, RemoteSource};
