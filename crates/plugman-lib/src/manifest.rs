//! The installed-plugin manifest, `{"plugins": ["publisher.name", ...]}`.
//!
//! The manifest stores no versions; keys read back from it always carry
//! `latest`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{PluginError, Result},
    key::PluginKey,
};

pub const MANIFEST_FILE_NAME: &str = "plugins.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledManifest {
    #[serde(default)]
    pub plugins: Vec<String>,
}

impl InstalledManifest {
    /// Manifest listing `keys` in order, each plugin once
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a PluginKey>) -> Self {
        let mut plugins: Vec<String> = Vec::new();
        for id in keys.into_iter().map(PluginKey::manifest_id) {
            if !plugins.contains(&id) {
                plugins.push(id);
            }
        }
        Self { plugins }
    }

    /// Keys of the listed plugins. Malformed entries are skipped with a warning.
    pub fn keys(&self) -> Vec<PluginKey> {
        self.plugins
            .iter()
            .filter_map(|id| match PluginKey::from_manifest_id(id) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(id = %id, err = %e, "skipping malformed manifest entry");
                    None
                }
            })
            .collect()
    }

    /// Read the manifest at `path`. A missing file is an empty manifest.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no installed plugin manifest yet");
                return Ok(Self::default());
            }
            Err(e) => return Err(manifest_error(path, e)),
        };
        serde_json::from_slice(&contents).map_err(|e| manifest_error(path, e.into()))
    }

    /// Replace the manifest at `path`, creating parent directories
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| manifest_error(path, e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| manifest_error(path, e.into()))?;

        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| manifest_error(path, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(manifest_error(path, e));
        }
        debug!(path = %path.display(), plugins = self.plugins.len(), "installed plugin manifest written");
        Ok(())
    }
}

fn manifest_error(path: &Path, source: std::io::Error) -> PluginError {
    PluginError::Manifest {
        path: path.to_path_buf(),
        source,
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
