//! The persisted workspace component list and the dev container plugins are
//! applied to.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{PluginError, Result};

/// Explicitly marks the component plugins are installed into
pub const DEV_CONTAINER_ATTRIBUTE: &str = "workspace.plugins/dev-container";
/// Marks a component as workspace infrastructure
pub const INFRASTRUCTURE_ATTRIBUTE: &str = "workspace.plugins/infrastructure";
/// List of extension URLs loaded into the dev container
pub const EXTENSIONS_ATTRIBUTE: &str = "workspace.plugins/extensions";
/// Map of editor preferences applied in the dev container
pub const PREFERENCES_ATTRIBUTE: &str = "workspace.plugins/preferences";

/// Components the workspace itself runs, never a dev container
const INFRASTRUCTURE_COMPONENTS: &[&str] = &["che-gateway", "che-machine-exec", "che-idle", "che-code-injector"];

/// File written next to the devfile when a restart is requested
pub const RESTART_MARKER: &str = ".restart-requested";

/// One entry of the persisted component list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    /// Fields this crate does not interpret, kept as-is on write
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_sources: Option<bool>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl Component {
    fn flag(&self, attribute: &str) -> bool {
        matches!(self.attributes.get(attribute), Some(Value::Bool(true)))
    }

    pub fn is_dev_container_annotated(&self) -> bool {
        self.flag(DEV_CONTAINER_ATTRIBUTE)
    }

    pub fn is_infrastructure(&self) -> bool {
        self.flag(INFRASTRUCTURE_ATTRIBUTE) || INFRASTRUCTURE_COMPONENTS.contains(&self.name.as_str())
    }

    /// Whether the component could host plugins: a container that is not
    /// infrastructure and mounts the workspace sources
    pub fn is_dev_container_candidate(&self) -> bool {
        match &self.container {
            Some(container) => !self.is_infrastructure() && container.mount_sources != Some(false),
            None => false,
        }
    }

    pub fn extensions(&self) -> Vec<String> {
        match self.attributes.get(EXTENSIONS_ATTRIBUTE) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn preferences(&self) -> BTreeMap<String, String> {
        match self.attributes.get(PREFERENCES_ATTRIBUTE) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Append `urls` not yet listed, returning whether anything changed
    pub fn add_extensions(&mut self, urls: &[String]) -> bool {
        let mut extensions = self.extensions();
        let before = extensions.len();
        for url in urls {
            if !extensions.contains(url) {
                extensions.push(url.clone());
            }
        }
        if extensions.len() == before {
            return false;
        }
        self.attributes
            .insert(EXTENSIONS_ATTRIBUTE.to_string(), Value::from(extensions));
        true
    }

    /// Drop every listed URL in `urls`, returning whether anything changed
    pub fn remove_extensions(&mut self, urls: &[String]) -> bool {
        let mut extensions = self.extensions();
        let before = extensions.len();
        extensions.retain(|url| !urls.contains(url));
        if extensions.len() == before {
            return false;
        }
        self.attributes
            .insert(EXTENSIONS_ATTRIBUTE.to_string(), Value::from(extensions));
        true
    }

    /// Merge `preferences` over the current ones, returning whether anything changed
    pub fn merge_preferences(&mut self, preferences: &BTreeMap<String, String>) -> bool {
        let mut current = self.preferences();
        let mut changed = false;
        for (key, value) in preferences {
            if current.get(key) != Some(value) {
                current.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        if changed {
            let map = current
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<serde_json::Map<_, _>>();
            self.attributes
                .insert(PREFERENCES_ATTRIBUTE.to_string(), Value::Object(map));
        }
        changed
    }
}

/// The component chosen to receive plugin attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevContainer {
    pub index: usize,
    /// Other candidates when the choice fell back to the first of several
    pub passed_over: Vec<String>,
}

/// Pick the dev container among `components`.
///
/// An explicit annotation wins and must be unique. Without one, the first
/// structural candidate is taken; any others are reported in
/// [`DevContainer::passed_over`].
pub fn select_dev_container(components: &[Component]) -> Result<DevContainer> {
    let annotated: Vec<usize> = components
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_dev_container_annotated())
        .map(|(i, _)| i)
        .collect();
    match annotated.as_slice() {
        [index] => {
            return Ok(DevContainer {
                index: *index,
                passed_over: Vec::new(),
            });
        }
        [] => {}
        many => {
            return Err(PluginError::AmbiguousDevContainer {
                names: many.iter().map(|i| components[*i].name.clone()).collect(),
            });
        }
    }

    let mut candidates = components
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_dev_container_candidate());
    let Some((index, chosen)) = candidates.next() else {
        return Err(PluginError::NoDevContainer);
    };
    let passed_over: Vec<String> = candidates.map(|(_, c)| c.name.clone()).collect();
    if !passed_over.is_empty() {
        warn!(
            chosen = %chosen.name,
            others = ?passed_over,
            "several components qualify as the dev container, using the first"
        );
    }
    Ok(DevContainer { index, passed_over })
}

/// Read-modify access to the persisted workspace definition
#[async_trait::async_trait]
pub trait Workspace: Send + Sync + 'static {
    /// The current component list
    async fn components(&self) -> anyhow::Result<Vec<Component>>;

    /// Replace the component list in a single write
    async fn patch_components(&self, components: Vec<Component>) -> anyhow::Result<()>;

    /// Ask the workspace to restart so container changes take effect
    async fn restart(&self) -> anyhow::Result<()>;
}

/// A devfile on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Devfile {
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// [`Workspace`] backed by a YAML devfile
#[derive(Debug, Clone)]
pub struct DevfileWorkspace {
    path: PathBuf,
}

impl DevfileWorkspace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the restart marker
    pub fn restart_marker(&self) -> PathBuf {
        self.path.with_file_name(RESTART_MARKER)
    }

    async fn read(&self) -> anyhow::Result<Devfile> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "devfile does not exist, using an empty one");
                return Ok(Devfile::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read devfile {}", self.path.display()));
            }
        };
        serde_yaml::from_slice(&contents)
            .with_context(|| format!("failed to parse devfile {}", self.path.display()))
    }
}

#[async_trait::async_trait]
impl Workspace for DevfileWorkspace {
    async fn components(&self) -> anyhow::Result<Vec<Component>> {
        Ok(self.read().await?.components)
    }

    async fn patch_components(&self, components: Vec<Component>) -> anyhow::Result<()> {
        let mut devfile = self.read().await?;
        devfile.components = components;
        let yaml = serde_yaml::to_string(&devfile).context("failed to serialize devfile")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace devfile {}", self.path.display()))?;
        debug!(path = %self.path.display(), "devfile components patched");
        Ok(())
    }

    async fn restart(&self) -> anyhow::Result<()> {
        let marker = self.restart_marker();
        let requested_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        tokio::fs::write(&marker, requested_at.to_string())
            .await
            .with_context(|| format!("failed to write restart marker {}", marker.display()))?;
        info!(marker = %marker.display(), "workspace restart requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container(name: &str, mount_sources: Option<bool>) -> Component {
        Component {
            name: name.to_string(),
            container: Some(Container {
                image: Some("quay.io/devfile/universal-developer-image".to_string()),
                mount_sources,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn annotated(name: &str) -> Component {
        let mut component = container(name, None);
        component
            .attributes
            .insert(DEV_CONTAINER_ATTRIBUTE.to_string(), json!(true));
        component
    }

    #[test]
    fn test_annotation_wins() {
        let components = vec![container("tools", None), annotated("dev")];
        assert_eq!(
            select_dev_container(&components).unwrap(),
            DevContainer {
                index: 1,
                passed_over: Vec::new()
            }
        );
    }

    #[test]
    fn test_multiple_annotations_are_ambiguous() {
        let components = vec![annotated("a"), annotated("b")];
        assert!(matches!(
            select_dev_container(&components),
            Err(PluginError::AmbiguousDevContainer { names }) if names == vec!["a", "b"]
        ));
    }

    #[test]
    fn test_heuristic_skips_infrastructure_and_unmounted() {
        let mut infra = container("proxy", None);
        infra
            .attributes
            .insert(INFRASTRUCTURE_ATTRIBUTE.to_string(), json!(true));
        let components = vec![
            container("che-gateway", None),
            infra,
            container("db", Some(false)),
            Component {
                name: "volume".to_string(),
                ..Default::default()
            },
            container("tools", None),
        ];
        assert_eq!(select_dev_container(&components).unwrap().index, 4);
    }

    #[test]
    fn test_heuristic_tie_picks_first() {
        let components = vec![container("tools", Some(true)), container("node", None)];
        let chosen = select_dev_container(&components).unwrap();
        assert_eq!(chosen.index, 0);
        assert_eq!(chosen.passed_over, vec!["node"]);
    }

    #[test]
    fn test_no_candidate() {
        let components = vec![container("db", Some(false))];
        assert!(matches!(
            select_dev_container(&components),
            Err(PluginError::NoDevContainer)
        ));
    }

    #[test]
    fn test_attribute_mutations() {
        let mut component = container("tools", None);
        let urls = vec!["https://a.vsix".to_string(), "https://b.vsix".to_string()];

        assert!(component.add_extensions(&urls));
        assert!(!component.add_extensions(&urls[..1]));
        assert_eq!(component.extensions(), urls);

        let prefs = BTreeMap::from([("java.home".to_string(), "/opt/java".to_string())]);
        assert!(component.merge_preferences(&prefs));
        assert!(!component.merge_preferences(&prefs));
        assert_eq!(component.preferences(), prefs);

        assert!(component.remove_extensions(&urls[..1]));
        assert!(!component.remove_extensions(&["https://c.vsix".to_string()]));
        assert_eq!(component.extensions(), vec!["https://b.vsix"]);
    }

    #[tokio::test]
    async fn test_devfile_patch_preserves_other_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devfile.yaml");
        std::fs::write(
            &path,
            r#"schemaVersion: 2.2.0
metadata:
  name: demo
components:
  - name: tools
    container:
      image: quay.io/devfile/universal-developer-image
      memoryLimit: 2Gi
    custom: kept
"#,
        )
        .unwrap();

        let workspace = DevfileWorkspace::new(&path);
        let mut components = workspace.components().await.unwrap();
        assert_eq!(components.len(), 1);
        components[0].add_extensions(&["https://a.vsix".to_string()]);
        workspace.patch_components(components).await.unwrap();

        let devfile: serde_yaml::Value = serde_yaml::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(devfile["schemaVersion"], serde_yaml::Value::from("2.2.0"));
        assert_eq!(devfile["metadata"]["name"], serde_yaml::Value::from("demo"));
        let tools = &devfile["components"][0];
        assert_eq!(tools["custom"], serde_yaml::Value::from("kept"));
        assert_eq!(tools["container"]["memoryLimit"], serde_yaml::Value::from("2Gi"));
        assert_eq!(
            tools["attributes"][EXTENSIONS_ATTRIBUTE][0],
            serde_yaml::Value::from("https://a.vsix")
        );
    }

    #[tokio::test]
    async fn test_restart_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = DevfileWorkspace::new(dir.path().join("devfile.yaml"));
        workspace.restart().await.unwrap();
        assert!(workspace.restart_marker().exists());
    }
}
