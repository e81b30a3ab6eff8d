//! On-disk storage for downloaded extension artifacts.
//!
//! Artifacts of plugins without a sidecar share the flat `plugins/` directory,
//! while each sidecar gets its own `sidecars/<name>/` directory.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use tracing::{debug, warn};
use url::Url;

use crate::{
    descriptor::PluginDescriptor,
    error::{PluginError, Result},
};

pub const PLUGINS_DIR: &str = "plugins";
pub const SIDECARS_DIR: &str = "sidecars";
const TRASH_PREFIX: &str = ".trash-";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of `descriptor`
    pub fn directory_for(&self, descriptor: &PluginDescriptor) -> PathBuf {
        match descriptor.sidecar_name() {
            Some(sidecar) => self.root.join(SIDECARS_DIR).join(sanitize_file_name(sidecar)),
            None => self.root.join(PLUGINS_DIR),
        }
    }

    /// Location of the artifact downloaded from `url` for `descriptor`
    pub fn path_for(&self, descriptor: &PluginDescriptor, url: &Url) -> PathBuf {
        self.directory_for(descriptor).join(artifact_file_name(url))
    }

    pub async fn contains(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Write `bytes` to `path`, creating parent directories. The file only
    /// appears under its final name once fully written.
    pub async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage(parent, e))?;
        }
        let partial = partial_path(path);
        tokio::fs::write(&partial, bytes)
            .await
            .map_err(|e| storage(&partial, e))?;
        if let Err(e) = tokio::fs::rename(&partial, path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(storage(path, e));
        }
        debug!(path = %path.display(), size = bytes.len(), "artifact stored");
        Ok(())
    }

    /// Delete the file at `path`, returning whether it existed
    pub async fn delete(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage(path, e)),
        }
    }

    /// Open a trash directory inside the store root. Files moved there can be
    /// put back until the trash is dropped, which deletes them for good.
    pub async fn trash(&self) -> Result<Trash> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| storage(&self.root, e))?;
        let dir = tempfile::Builder::new()
            .prefix(TRASH_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| storage(&self.root, e))?;
        Ok(Trash {
            dir,
            moved: Vec::new(),
        })
    }
}

/// Files removed from the store during one commit
#[derive(Debug)]
pub struct Trash {
    dir: TempDir,
    moved: Vec<(PathBuf, PathBuf)>,
}

impl Trash {
    /// Move the file at `path` into the trash. A missing file is not an error.
    pub async fn discard(&mut self, path: &Path) -> Result<bool> {
        let trashed = self.dir.path().join(self.moved.len().to_string());
        match tokio::fs::rename(path, &trashed).await {
            Ok(()) => {
                self.moved.push((path.to_path_buf(), trashed));
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage(path, e)),
        }
    }

    /// Original locations of every discarded file
    pub fn discarded(&self) -> impl Iterator<Item = &Path> {
        self.moved.iter().map(|(original, _)| original.as_path())
    }

    /// Put every discarded file back where it came from
    pub async fn restore(mut self) {
        while let Some((original, trashed)) = self.moved.pop() {
            if let Err(e) = tokio::fs::rename(&trashed, &original).await {
                warn!(
                    path = %original.display(),
                    err = %e,
                    "failed to restore removed artifact"
                );
            }
        }
    }
}

fn storage(path: &Path, source: std::io::Error) -> PluginError {
    PluginError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// File name of an artifact, taken from the last segment of its URL path
pub fn artifact_file_name(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("artifact");
    sanitize_file_name(segment)
}

/// Sanitize a name for filesystem storage
///
/// Replaces every character that is not safe in file names across operating
/// systems. Dots are kept so extensions survive, but a name made only of dots
/// is replaced entirely.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    if sanitized.chars().all(|c| c == '.') {
        "_".repeat(sanitized.len().max(1))
    } else {
        sanitized
    }
}
