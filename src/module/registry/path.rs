//! Module path resolution
//!
//! Parses module identifiers into a [`ModuleSource`], resolves floating or
//! missing tags to a concrete one, and computes where a module's code lives
//! on disk.
//!
//! Supported identifiers:
//! - `remote:<owner>/<name>` or `remote:<owner>/<name>#<tag>`
//! - `local:<path>`, or a bare path starting with `/`, `./`, `../` or `~`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::module::registry::source::RemoteSource;
use crate::module::traits::ModuleError;

/// Prefix of remote identifiers
pub const REMOTE_PREFIX: &str = "remote:";
/// Prefix of explicit local identifiers
pub const LOCAL_PREFIX: &str = "local:";
/// Name of the floating branch that always tracks the newest code
pub const FLOATING_TAG: &str = "latest";

/// Where a module's code comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleSource {
    /// Fetched from a remote host
    Remote {
        owner: String,
        name: String,
        tag: Option<String>,
    },
    /// Already present on the local filesystem
    Local { path: PathBuf },
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::Remote { owner, name, tag } => {
                write!(f, "{}{}/{}", REMOTE_PREFIX, owner, name)?;
                if let Some(tag) = tag {
                    write!(f, "#{}", tag)?;
                }
                Ok(())
            }
            ModuleSource::Local { path } => write!(f, "{}{}", LOCAL_PREFIX, path.display()),
        }
    }
}

/// Parse an identifier into a module source
///
/// Returns `None` on unrecognized syntax; callers surface that as an
/// invalid path error.
pub fn expand(identifier: &str) -> Option<ModuleSource> {
    let identifier = identifier.trim();

    if let Some(rest) = identifier.strip_prefix(REMOTE_PREFIX) {
        let (repo, tag) = match rest.split_once('#') {
            Some((repo, tag)) => {
                if !is_valid_segment(tag) {
                    return None;
                }
                (repo, Some(tag.to_string()))
            }
            None => (rest, None),
        };
        let (owner, name) = repo.split_once('/')?;
        if !is_valid_segment(owner) || !is_valid_segment(name) {
            return None;
        }
        return Some(ModuleSource::Remote {
            owner: owner.to_string(),
            name: name.to_string(),
            tag,
        });
    }

    let raw = match identifier.strip_prefix(LOCAL_PREFIX) {
        Some(rest) => rest,
        None if looks_like_path(identifier) => identifier,
        None => return None,
    };
    if raw.is_empty() {
        return None;
    }

    let path = expand_home(raw)?;
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    Some(ModuleSource::Local { path })
}

/// Resolve an identifier to its canonical form
///
/// Remote identifiers get a concrete tag: an existing tag is kept, the
/// floating branch is kept, and a missing tag becomes the highest released
/// version (or the floating branch when nothing has been released). Local
/// identifiers must exist on disk.
pub async fn augment(identifier: &str, source: &dyn RemoteSource) -> Result<String, ModuleError> {
    let parsed = expand(identifier).ok_or_else(|| ModuleError::InvalidPath(identifier.to_string()))?;

    match parsed {
        ModuleSource::Remote { owner, name, tag } => {
            let tags = source.list_tags(&owner, &name).await?;
            let resolved = select_tag(tag.as_deref(), &tags)?;
            debug!("Resolved {}/{} to tag {}", owner, name, resolved);
            Ok(ModuleSource::Remote {
                owner,
                name,
                tag: Some(resolved),
            }
            .to_string())
        }
        ModuleSource::Local { path } => {
            let canonical = tokio::fs::canonicalize(&path).await.map_err(|e| {
                ModuleError::Resolution(format!("{} does not exist: {}", path.display(), e))
            })?;
            Ok(ModuleSource::Local { path: canonical }.to_string())
        }
    }
}

/// Pick the tag a remote identifier resolves to
pub fn select_tag(requested: Option<&str>, tags: &[String]) -> Result<String, ModuleError> {
    match requested {
        Some(tag) if tags.iter().any(|t| t == tag) => Ok(tag.to_string()),
        Some(FLOATING_TAG) => Ok(FLOATING_TAG.to_string()),
        Some(tag) => Err(ModuleError::Resolution(format!("tag {} does not exist", tag))),
        None => Ok(sort_tags(tags)
            .into_iter()
            .find(|(_, version)| version.pre.is_empty())
            .map(|(tag, _)| tag)
            .unwrap_or_else(|| FLOATING_TAG.to_string())),
    }
}

/// Semantic-version tags ordered newest first; non-version tags are dropped
pub fn sort_tags(tags: &[String]) -> Vec<(String, semver::Version)> {
    let mut ordered: Vec<(String, semver::Version)> = tags
        .iter()
        .filter_map(|tag| parse_tag_version(tag).map(|v| (tag.clone(), v)))
        .collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1));
    ordered
}

/// Parse `1.2.3` or `v1.2.3`
pub fn parse_tag_version(tag: &str) -> Option<semver::Version> {
    let trimmed = tag.strip_prefix('v').unwrap_or(tag);
    semver::Version::parse(trimmed).ok()
}

/// Local directory holding a module's code
///
/// Pure function of the source: remote modules live under
/// `<root>/<owner>/<name>@<tag>`, local modules are used where they are.
pub fn storage_path(source: &ModuleSource, root: &Path) -> PathBuf {
    match source {
        ModuleSource::Remote { owner, name, tag } => root
            .join(owner)
            .join(format!("{}@{}", name, tag.as_deref().unwrap_or(FLOATING_TAG))),
        ModuleSource::Local { path } => path.clone(),
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn looks_like_path(identifier: &str) -> bool {
    identifier.starts_with("./")
        || identifier.starts_with("../")
        || identifier.starts_with('~')
        || Path::new(identifier).is_absolute()
}

fn expand_home(raw: &str) -> Option<PathBuf> {
    match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => {
            let home = home_dir()?;
            Some(home.join(rest.trim_start_matches(['/', '\\'])))
        }
        // `~user` is not supported
        Some(_) => None,
        None => Some(PathBuf::from(raw)),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
