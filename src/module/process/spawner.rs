//! Module process spawning
//!
//! Starts a module's entry point with stdin/stdout as its bus channel and
//! stderr captured as output.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};
use uuid::Uuid;

use crate::module::ipc::protocol::PROTOCOL_VERSION;
use crate::module::registry::manifest::ModuleManifest;
use crate::module::traits::{ModuleDescriptor, ModuleError};

/// Environment variables handed to every module process
pub const ENV_MODULE_NAME: &str = "MODULE_NAME";
pub const ENV_MODULE_PATH: &str = "MODULE_PATH";
pub const ENV_MODULE_INSTANCE: &str = "MODULE_INSTANCE";
pub const ENV_MODULE_PROTOCOL: &str = "MODULE_PROTOCOL";

/// Everything needed to (re)launch a module
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    /// Canonical registry path
    pub path: String,
    /// Module root, used as the working directory
    pub storage: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(
        descriptor: &ModuleDescriptor,
        storage: PathBuf,
        manifest: &ModuleManifest,
    ) -> Result<Self, ModuleError> {
        let program = manifest.resolve_entry_point(&storage)?;
        Ok(Self {
            name: descriptor.name.clone(),
            path: descriptor.path.clone(),
            storage,
            program,
            args: manifest.args.clone(),
        })
    }
}

/// A freshly spawned module process with its pipes
pub struct ModuleProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub instance: Uuid,
}

impl ModuleProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawn a module process
pub fn spawn(spec: &LaunchSpec) -> Result<ModuleProcess, ModuleError> {
    let instance = Uuid::new_v4();
    info!("Spawning module process: {} ({})", spec.name, spec.program.display());

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.storage)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env(ENV_MODULE_NAME, &spec.name)
        .env(ENV_MODULE_PATH, &spec.path)
        .env(ENV_MODULE_INSTANCE, instance.to_string())
        .env(ENV_MODULE_PROTOCOL, PROTOCOL_VERSION.to_string());

    debug!("Spawning process: {:?}", command);

    let mut child = command.spawn().map_err(|e| {
        ModuleError::SpawnFailed(format!("{}: {}", spec.program.display(), e))
    })?;

    let missing = |stream: &str| ModuleError::SpawnFailed(format!("{} not captured", stream));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    Ok(ModuleProcess {
        child,
        stdin,
        stdout,
        stderr,
        instance,
    })
}
