use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{error::PluginError, key::PluginKey};

/// The file name registries use for plugin descriptors
pub const DESCRIPTOR_FILE_NAME: &str = "meta.yaml";

/// Identity and display metadata of a plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub id: String,
    pub publisher: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

fn default_version() -> String {
    crate::key::LATEST.to_string()
}

/// A volume mounted into a sidecar container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub path: String,
}

/// The auxiliary container a plugin needs when it runs out of process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Resolved metadata for one plugin, as published in a registry's `meta.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<Sidecar>,
    /// Extension artifact URLs to download when installed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PluginKey>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub preferences: BTreeMap<String, String>,
}

impl PluginDescriptor {
    /// Parse a YAML or JSON descriptor. `source` names where the bytes came
    /// from and only appears in errors.
    ///
    /// A dependency on the plugin itself is dropped with a warning.
    pub fn parse(bytes: &[u8], source: &str) -> Result<Self, PluginError> {
        let mut descriptor: PluginDescriptor =
            serde_yaml::from_slice(bytes).map_err(|e| PluginError::InvalidDescriptor {
                url: source.to_string(),
                source: e,
            })?;
        let key = descriptor.key();
        if descriptor.dependencies.contains(&key) {
            warn!(key = %key, "descriptor declares a dependency on itself, ignoring it");
            descriptor.dependencies.retain(|dep| dep != &key);
        }
        if descriptor.metadata.id.is_empty() {
            descriptor.metadata.id = key.to_string();
        }
        Ok(descriptor)
    }

    pub fn key(&self) -> PluginKey {
        PluginKey::new(
            &self.metadata.publisher,
            &self.metadata.name,
            &self.metadata.version,
        )
    }

    /// Human readable title, falling back to the plugin name
    pub fn title(&self) -> &str {
        self.metadata
            .display_name
            .as_deref()
            .unwrap_or(&self.metadata.name)
    }

    /// The sidecar name artifacts are grouped under, if the plugin runs out of process
    pub fn sidecar_name(&self) -> Option<&str> {
        self.sidecar
            .as_ref()
            .map(|sidecar| sidecar.name.as_deref().unwrap_or(&self.metadata.name))
    }

    /// Whether committing this plugin touches the dev container attributes
    pub fn contributes_to_dev_container(&self) -> bool {
        !self.extensions.is_empty() || !self.preferences.is_empty()
    }
}
