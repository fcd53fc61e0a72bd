//! Process management for modules
//!
//! Handles spawning, output capture, exit monitoring, and supervised restarts
//! of module processes.

pub mod monitor;
pub mod output;
pub mod spawner;
pub mod supervisor;

pub use monitor::{ExitNotice, ProcessControl};
pub use output::OutputLog;
pub use spawner::{spawn, LaunchSpec, ModuleProcess};
pub use supervisor::{RunningModule, RunningTable, Supervisor, SupervisorConfig};
