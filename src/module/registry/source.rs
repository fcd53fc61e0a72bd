//! Remote module sources
//!
//! A remote source lists a module's tags, serves its manifest for a given
//! tag, and serves a gzipped tarball of its code. The HTTP implementation
//! speaks to a GitHub-compatible host.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::module::registry::path::FLOATING_TAG;
use crate::module::traits::ModuleError;

/// Manifest file name at the root of every module
pub const MANIFEST_FILE: &str = "module.toml";

/// Source of remote module code and metadata
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// All tags published for `owner/name`
    async fn list_tags(&self, owner: &str, name: &str) -> Result<Vec<String>, ModuleError>;

    /// Raw `module.toml` contents at `tag`
    async fn fetch_manifest(&self, owner: &str, name: &str, tag: &str)
        -> Result<String, ModuleError>;

    /// Gzipped tarball of the module code at `tag`, with one leading directory
    async fn fetch_archive(&self, owner: &str, name: &str, tag: &str) -> Result<Bytes, ModuleError>;
}

/// Source used when remote fetching is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemoteSource;

#[async_trait]
impl RemoteSource for NoRemoteSource {
    async fn list_tags(&self, owner: &str, name: &str) -> Result<Vec<String>, ModuleError> {
        Err(ModuleError::Fetch(format!(
            "remote sources disabled, cannot list tags of {}/{}",
            owner, name
        )))
    }

    async fn fetch_manifest(
        &self,
        owner: &str,
        name: &str,
        _tag: &str,
    ) -> Result<String, ModuleError> {
        Err(ModuleError::Fetch(format!(
            "remote sources disabled, cannot fetch {}/{}",
            owner, name
        )))
    }

    async fn fetch_archive(&self, owner: &str, name: &str, _tag: &str) -> Result<Bytes, ModuleError> {
        Err(ModuleError::Fetch(format!(
            "remote sources disabled, cannot fetch {}/{}",
            owner, name
        )))
    }
}

/// Git ref a tag maps to on the remote host
fn git_ref(tag: &str) -> &str {
    if tag == FLOATING_TAG {
        "HEAD"
    } else {
        tag
    }
}

#[cfg(feature = "http-source")]
pub use http::HttpSource;

#[cfg(feature = "http-source")]
mod http {
    use super::*;
    use reqwest::Client;
    use serde::Deserialize;
    use std::time::Duration;

    use crate::config::RemoteConfig;

    #[derive(Debug, Deserialize)]
    struct TagEntry {
        name: String,
    }

    /// Remote source backed by a GitHub-compatible HTTP API
    pub struct HttpSource {
        client: Client,
        config: RemoteConfig,
    }

    impl HttpSource {
        pub fn new(config: RemoteConfig) -> Result<Self, ModuleError> {
            let client = Client::builder()
                .user_agent(config.user_agent.clone())
                .timeout(Duration::from_secs(config.timeout_seconds))
                .build()
                .map_err(|e| ModuleError::Fetch(format!("Failed to build HTTP client: {}", e)))?;
            Ok(Self { client, config })
        }

        async fn get(&self, url: &str) -> Result<reqwest::Response, ModuleError> {
            debug!("GET {}", url);
            self.client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| ModuleError::Fetch(format!("{}: {}", url, e)))
        }
    }

    #[async_trait]
    impl RemoteSource for HttpSource {
        async fn list_tags(&self, owner: &str, name: &str) -> Result<Vec<String>, ModuleError> {
            let url = format!(
                "{}/repos/{}/{}/tags?per_page=100",
                self.config.api_base, owner, name
            );
            let entries: Vec<TagEntry> = self
                .get(&url)
                .await?
                .json()
                .await
                .map_err(|e| ModuleError::Fetch(format!("{}: {}", url, e)))?;
            Ok(entries.into_iter().map(|t| t.name).collect())
        }

        async fn fetch_manifest(
            &self,
            owner: &str,
            name: &str,
            tag: &str,
        ) -> Result<String, ModuleError> {
            let url = format!(
                "{}/{}/{}/{}/{}",
                self.config.raw_base,
                owner,
                name,
                git_ref(tag),
                MANIFEST_FILE
            );
            self.get(&url)
                .await?
                .text()
                .await
                .map_err(|e| ModuleError::Fetch(format!("{}: {}", url, e)))
        }

        async fn fetch_archive(
            &self,
            owner: &str,
            name: &str,
            tag: &str,
        ) -> Result<Bytes, ModuleError> {
            let url = format!(
                "{}/repos/{}/{}/tarball/{}",
                self.config.api_base,
                owner,
                name,
                git_ref(tag)
            );
            self.get(&url)
                .await?
                .bytes()
                .await
                .map_err(|e| ModuleError::Fetch(format!("{}: {}", url, e)))
        }
    }
}

/// Extract a gzipped tarball into `dest`, dropping the first path component
///
/// Entries with absolute paths or `..` components are rejected.
pub fn unpack_archive(archive: &[u8], dest: &Path) -> Result<(), ModuleError> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(archive));

    let entries = archive
        .entries()
        .map_err(|e| ModuleError::InstallationFailed(format!("invalid archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| ModuleError::InstallationFailed(format!("archive entry: {}", e)))?;
        let header_type = entry.header().entry_type();
        if header_type.is_pax_global_extensions() || header_type.is_pax_local_extensions() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| ModuleError::InstallationFailed(format!("archive path: {}", e)))?
            .into_owned();
        let relative = strip_first_component(&path)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(&relative);
        if header_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target).map_err(|e| {
            ModuleError::InstallationFailed(format!("extract {}: {}", relative.display(), e))
        })?;
    }
    Ok(())
}

fn strip_first_component(path: &Path) -> Result<PathBuf, ModuleError> {
    let mut stripped = PathBuf::new();
    for component in path.components().skip(1) {
        match component {
            Component::Normal(part) => stripped.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ModuleError::InstallationFailed(format!(
                    "unsupported or malicious path in archive: {}",
                    path.display()
                )))
            }
        }
    }
    if matches!(
        path.components().next(),
        Some(Component::RootDir) | Some(Component::Prefix(_)) | Some(Component::ParentDir)
    ) {
        return Err(ModuleError::InstallationFailed(format!(
            "unsupported or malicious path in archive: {}",
            path.display()
        )));
    }
    Ok(stripped)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Build a gzipped tarball whose files sit under `prefix/`
    pub fn tarball(prefix: &str, files: &[(&str, &str)]) -> Bytes {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{}/{}", prefix, name), contents.as_bytes())
                .unwrap();
        }
        let encoder = builder.into_inner().unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    pub fn manifest(name: &str, version: &str) -> String {
        format!(
            "name = \"{}\"\nversion = \"{}\"\nentry_point = \"run.sh\"\n",
            name, version
        )
    }

    /// Scripted remote source: tags, manifests per tag, and a fetch counter
    #[derive(Default)]
    pub struct ScriptedSource {
        pub tags: Mutex<HashMap<String, Vec<String>>>,
        pub manifests: Mutex<HashMap<String, String>>,
        pub archives: Mutex<HashMap<String, Bytes>>,
        pub archive_fetches: AtomicUsize,
        pub fail_archives: std::sync::atomic::AtomicBool,
    }

    impl ScriptedSource {
        /// Publish a tag whose manifest carries `version`
        pub fn publish(&self, owner: &str, name: &str, tag: &str, version: &str) {
            self.publish_manifest(owner, name, tag, manifest(name, version));
        }

        /// Publish a tag with explicit manifest contents
        pub fn publish_manifest(&self, owner: &str, name: &str, tag: &str, manifest: String) {
            let repo = format!("{}/{}", owner, name);
            self.tags
                .lock()
                .unwrap()
                .entry(repo.clone())
                .or_default()
                .push(tag.to_string());
            self.archives.lock().unwrap().insert(
                format!("{}#{}", repo, tag),
                tarball(
                    &format!("{}-{}", name, tag),
                    &[("module.toml", manifest.as_str()), ("run.sh", "#!/bin/sh\nexit 0\n")],
                ),
            );
            self.manifests
                .lock()
                .unwrap()
                .insert(format!("{}#{}", repo, tag), manifest);
        }

        pub fn fetches(&self) -> usize {
            self.archive_fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedSource {
        async fn list_tags(&self, owner: &str, name: &str) -> Result<Vec<String>, ModuleError> {
            Ok(self
                .tags
                .lock()
                .unwrap()
                .get(&format!("{}/{}", owner, name))
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_manifest(
            &self,
            owner: &str,
            name: &str,
            tag: &str,
        ) -> Result<String, ModuleError> {
            self.manifests
                .lock()
                .unwrap()
                .get(&format!("{}/{}#{}", owner, name, tag))
                .cloned()
                .ok_or_else(|| ModuleError::Fetch(format!("no manifest for {}/{}#{}", owner, name, tag)))
        }

        async fn fetch_archive(
            &self,
            owner: &str,
            name: &str,
            tag: &str,
        ) -> Result<Bytes, ModuleError> {
            self.archive_fetches.fetch_add(1, Ordering::SeqCst);
            // Give concurrent installers a chance to pile onto the ticket
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail_archives.load(Ordering::SeqCst) {
                return Err(ModuleError::Fetch("scripted failure".to_string()));
            }
            self.archives
                .lock()
                .unwrap()
                .get(&format!("{}/{}#{}", owner, name, tag))
                .cloned()
                .ok_or_else(|| ModuleError::Fetch(format!("no archive for {}/{}#{}", owner, name, tag)))
        }
    }
}
