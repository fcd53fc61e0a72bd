//! modhost - manage and run process-isolated modules
//!
//! Usage:
//!   modhost [--config <file>] add <identifier> [--force]
//!   modhost [--config <file>] run <path>...

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use module_host::config::HostConfig;
use module_host::module::{ManagerEvent, ModuleManager};
use module_host::utils::{init_logging_from_config, wait_for_shutdown_signal};

#[derive(Parser, Debug)]
#[command(name = "modhost")]
#[command(version, about = "Manage and run process-isolated modules", long_about = None)]
struct Args {
    /// Configuration file (.json or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a module (`remote:owner/name[#tag]` or a local path)
    Add {
        identifier: String,
        /// Replace a registered module with the same name or source
        #[arg(long)]
        force: bool,
    },
    /// Materialize a registered module and its dependencies
    Install { path: String },
    /// Unregister a module and delete its downloaded code
    Remove { path: String },
    /// Move a module to its newest release or refresh its branch
    Update { path: String },
    /// List registered modules
    List,
    /// Print a module's captured output
    Output { path: String },
    /// Run modules in the foreground until interrupted
    Run {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HostConfig::default(),
    };
    init_logging_from_config(&config.logging);

    let manager = ModuleManager::from_config(&config)?;

    match args.command {
        Command::Add { identifier, force } => {
            let descriptor = manager.add(&identifier, force).await?;
            println!("{} {} {}", descriptor.path, descriptor.name, descriptor.version);
        }
        Command::Install { path } => {
            let descriptor = manager.install(&path).await?;
            println!("installed {} {}", descriptor.name, descriptor.version);
        }
        Command::Remove { path } => {
            let descriptor = manager.remove(&path).await?;
            println!("removed {}", descriptor.path);
        }
        Command::Update { path } => {
            let descriptor = manager.update(&path).await?;
            println!("{} {} {}", descriptor.path, descriptor.name, descriptor.version);
        }
        Command::List => {
            for view in manager.list().await? {
                println!(
                    "{:<24} {:<12} {:<10} {}",
                    view.name,
                    view.version,
                    if view.local { "local" } else { "remote" },
                    view.path
                );
            }
        }
        Command::Output { path } => {
            print!("{}", manager.output(&path).await?);
        }
        Command::Run { paths } => run(&manager, &paths).await?,
    }

    Ok(())
}

async fn run(manager: &ModuleManager, paths: &[String]) -> Result<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::StateChange(descriptor)) => {
                    info!("Module {} changed state", descriptor.name)
                }
                Ok(ManagerEvent::UpdateReady(descriptor)) => {
                    info!("Module {} {} is ready to restart", descriptor.name, descriptor.version)
                }
                Ok(ManagerEvent::RpcTrace { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} lifecycle notifications", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    for path in paths {
        let descriptor = manager
            .run(path)
            .await
            .with_context(|| format!("Failed to run {}", path))?;
        info!("Running {} ({})", descriptor.name, descriptor.version);
    }

    wait_for_shutdown_signal().await;
    manager.shutdown().await;
    Ok(())
}
