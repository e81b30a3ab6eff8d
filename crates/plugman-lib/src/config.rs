//! Contains the [Config] struct and related functions for loading, saving and
//! merging plugman configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::registry::{Registries, Registry};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const PROJECT_CONFIG_DIR: &str = ".plugman";
pub const ENV_PREFIX: &str = "PLUGMAN_";

pub const DEFAULT_REGISTRY_NAME: &str = "default";
pub const DEFAULT_REGISTRY_URL: &str = "https://che-plugin-registry-main.surge.sh/v3";

/// Main plugman configuration with hierarchical merging support
///
/// The "global" [Config] lives under the user's XDG_CONFIG_HOME directory
/// (typically `~/.config/plugman/config.json`), while a project can override
/// it in `.plugman/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Registries plugins are listed from (default: the public plugin registry)
    #[serde(default = "default_registries")]
    pub registries: Vec<Registry>,

    /// Name of the registry plugins missing from the cache are fetched from
    #[serde(default = "default_registry_name")]
    pub default_registry: String,

    /// Check that extension artifacts are reachable before staging an install
    #[serde(default = "default_verify_artifacts")]
    pub verify_artifacts: bool,

    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

/// Where the workspace state lives. Unset paths fall back to the data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Devfile holding the persisted component list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devfile: Option<PathBuf>,

    /// Root directory for downloaded artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<PathBuf>,

    /// Installed-plugin manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registries: default_registries(),
            default_registry: default_registry_name(),
            verify_artifacts: default_verify_artifacts(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

fn default_registries() -> Vec<Registry> {
    match Url::parse(DEFAULT_REGISTRY_URL) {
        Ok(url) => vec![Registry::new(DEFAULT_REGISTRY_NAME, url)],
        Err(_) => Vec::new(),
    }
}

fn default_registry_name() -> String {
    DEFAULT_REGISTRY_NAME.to_string()
}

fn default_verify_artifacts() -> bool {
    true
}

impl Config {
    /// The configured registries, validated against `default_registry`
    pub fn registries(&self) -> Result<Registries> {
        Registries::from_list(self.registries.iter().cloned(), &self.default_registry)
            .context("invalid registry configuration")
    }

    /// Replace the configured registries with `registries`
    pub fn set_registries(&mut self, registries: &Registries) {
        self.registries = registries.iter().cloned().collect();
        self.default_registry = registries.default_registry().name.clone();
    }
}

/// Load configuration with hierarchical merging
/// Order of precedence (lowest to highest):
/// 1. Default values
/// 2. Global config (~/.config/plugman/config.json)
/// 3. Local project config (.plugman/config.json)
/// 4. Environment variables (PLUGMAN_ prefix, `__` separating nested keys)
/// 5. Command line arguments
///
/// Command line arguments only override the fields they serialize, so unset
/// flags should be skipped during serialization.
pub fn load_config<T>(
    global_config_path: &Path,
    project_dir: Option<&Path>,
    cli_args: Option<T>,
) -> Result<Config>
where
    T: Serialize,
{
    let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

    if global_config_path.exists() {
        figment = figment.merge(Json::file(global_config_path));
    }

    if let Some(project_dir) = project_dir {
        let local_config_path = local_config_path(project_dir);
        if local_config_path.exists() {
            figment = figment.merge(Json::file(local_config_path));
        }
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(args) = cli_args {
        figment = figment.merge(Serialized::defaults(args));
    }

    figment
        .extract()
        .context("Failed to load plugman configuration")
}

/// Save configuration to specified path
pub async fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!(
                "Failed to create config directory: {parent}",
                parent = parent.display()
            )
        })?;
    }

    let json = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Get the local project configuration file path
pub fn local_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

/// Generate a default configuration file with all explicit defaults
pub async fn generate_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Configuration file already exists at {}. Use --force to overwrite",
            path.display()
        );
    }

    save_config(&Config::default(), path).await?;

    info!(config_path = %path.display(), "Generated default configuration");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use figment::Jail;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        verify_artifacts: Option<bool>,
    }

    fn registry(name: &str, url: &str) -> Registry {
        Registry::new(name, Url::parse(url).unwrap())
    }

    #[test]
    fn test_load_config_only_defaults() {
        Jail::expect_with(|jail| {
            let config = load_config(&jail.directory().join(CONFIG_FILE_NAME), None, None::<Config>)
                .expect("configuration should be loadable");
            assert_eq!(config, Config::default());
            assert_eq!(
                config.registries().expect("default registries are valid").default_registry().name,
                DEFAULT_REGISTRY_NAME
            );
            Ok(())
        });
    }

    #[test]
    fn test_load_config_with_local_config() {
        Jail::expect_with(|jail| {
            let mut global_config = Config::default();
            global_config
                .registries
                .push(registry("internal", "https://registry.internal/v3"));
            let global = serde_json::to_string(&global_config).expect("config should serialize");
            jail.create_file(CONFIG_FILE_NAME, &global)?;

            std::fs::create_dir_all(jail.directory().join(PROJECT_CONFIG_DIR))
                .expect("project config dir should be creatable");
            // Only overrides two fields, registries come from the global config
            jail.create_file(
                local_config_path(Path::new(".")),
                r#"{"verify_artifacts": false, "default_registry": "internal"}"#,
            )?;

            let config = load_config(
                &jail.directory().join(CONFIG_FILE_NAME),
                Some(jail.directory()),
                None::<Config>,
            )
            .expect("configuration should be loadable");
            assert!(!config.verify_artifacts);
            assert_eq!(config.registries, global_config.registries);
            assert_eq!(
                config.registries().expect("registries are valid").default_registry().name,
                "internal"
            );
            Ok(())
        });
    }

    #[test]
    fn test_load_config_with_env_vars_and_cli_args() {
        Jail::expect_with(|jail| {
            jail.set_env("PLUGMAN_VERIFY_ARTIFACTS", "false");
            jail.set_env("PLUGMAN_WORKSPACE__DEVFILE", "/projects/devfile.yaml");
            let global_path = jail.directory().join(CONFIG_FILE_NAME);

            let config = load_config(&global_path, None, None::<Config>)
                .expect("configuration should be loadable");
            assert!(!config.verify_artifacts);
            assert_eq!(
                config.workspace.devfile,
                Some(PathBuf::from("/projects/devfile.yaml"))
            );

            let config = load_config(
                &global_path,
                None,
                Some(Overrides {
                    verify_artifacts: Some(true),
                }),
            )
            .expect("configuration should be loadable");
            assert!(config.verify_artifacts);
            assert_eq!(
                config.workspace.devfile,
                Some(PathBuf::from("/projects/devfile.yaml"))
            );
            Ok(())
        });
    }

    #[test]
    fn test_unknown_default_registry_is_rejected() {
        let config = Config {
            default_registry: "missing".to_string(),
            ..Default::default()
        };
        assert!(config.registries().is_err());
    }

    #[test]
    fn test_set_registries() {
        let mut registries = Config::default().registries().unwrap();
        registries.insert(registry("internal", "https://registry.internal/v3"));
        registries.set_default("internal").unwrap();

        let mut config = Config::default();
        config.set_registries(&registries);
        assert_eq!(config.default_registry, "internal");
        assert_eq!(config.registries.len(), 2);
    }

    #[tokio::test]
    async fn test_generate_default_config_refuses_overwrite() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(CONFIG_FILE_NAME);
        generate_default_config(&path, false).await?;
        assert!(generate_default_config(&path, false).await.is_err());
        generate_default_config(&path, true).await?;
        Ok(())
    }
}
