//! Test utilities for module host integration tests
//!
//! Provides an isolated manager over an in-memory oplog and helpers for
//! laying out local modules that run the bundled `echo-module` binary.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use module_host::config::ModulesConfig;
use module_host::module::registry::{MemoryOpLog, NoRemoteSource, OpLog};
use module_host::module::{ModuleManager, ModuleState, ModuleView};

/// Test fixture for module host tests
pub struct HostFixture {
    /// Temporary directory holding storage, logs and module sources
    pub temp_dir: TempDir,
    pub config: ModulesConfig,
    pub manager: ModuleManager,
}

impl HostFixture {
    /// Fixture with an in-memory registry
    pub fn new() -> Self {
        Self::with_oplog(|_| Arc::new(MemoryOpLog::new()))
    }

    /// Fixture whose registry is backed by the oplog `make` builds from the config
    pub fn with_oplog(make: impl FnOnce(&ModulesConfig) -> Arc<dyn OpLog>) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ModulesConfig::default();
        config.rebase(temp_dir.path());
        config.kill_grace_millis = 500;
        let oplog = make(&config);
        let manager = ModuleManager::new(&config, oplog, Arc::new(NoRemoteSource));
        Self {
            temp_dir,
            config,
            manager,
        }
    }

    /// Write a local module running `echo-module`, returning its identifier
    pub fn echo_module(&self, name: &str, follow: Option<&str>) -> String {
        let dir = self.temp_dir.path().join("sources").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let args = follow
            .map(|f| format!("args = [\"--follow\", \"{}\"]\n", f))
            .unwrap_or_default();
        write_manifest(
            &dir,
            &format!(
                "name = \"{}\"\nversion = \"0.1.0\"\nentry_point = \"{}\"\n{}",
                name,
                env!("CARGO_BIN_EXE_echo-module"),
                args
            ),
        );
        format!("local:{}", dir.display())
    }

    /// Write a local module whose entry point is a shell script
    pub fn script_module(&self, name: &str, script: &str) -> String {
        let dir = self.temp_dir.path().join("sources").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        write_manifest(
            &dir,
            &format!(
                "name = \"{}\"\nversion = \"0.1.0\"\nentry_point = \"sh\"\nargs = [\"-c\", {:?}]\n",
                name, script
            ),
        );
        format!("local:{}", dir.display())
    }

    pub async fn view(&self, name: &str) -> Option<ModuleView> {
        self.manager
            .list()
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.name == name)
    }

    /// Wait until `name` has sent its ready notification
    pub async fn wait_running(&self, name: &str) {
        wait_for(|| async move {
            self.view(name)
                .await
                .map(|v| v.state == Some(ModuleState::Running))
                .unwrap_or(false)
        })
        .await;
    }

    /// Wait until `name` is no longer managed by the supervisor
    pub async fn wait_unmanaged(&self, name: &str) {
        wait_for(|| async move {
            self.view(name)
                .await
                .map(|v| v.state.is_none())
                .unwrap_or(true)
        })
        .await;
    }

    /// Wait until the captured output of `path` contains `needle`
    pub async fn wait_output(&self, path: &str, needle: &str) {
        wait_for(|| async move {
            self.manager
                .output(path)
                .await
                .map(|text| text.contains(needle))
                .unwrap_or(false)
        })
        .await;
    }
}

pub fn write_manifest(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("module.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

/// Poll `condition` every 20ms for up to 10s
pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 10s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
