//! The main module for the plugman CLI, providing command line interface functionality

use std::{
    future::Future,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use etcetera::{AppStrategy as _, AppStrategyArgs, choose_app_strategy};

#[cfg(windows)]
use etcetera::app_strategy::Windows;
#[cfg(unix)]
use etcetera::app_strategy::Xdg;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, trace};

use plugman_lib::{
    config::{CONFIG_FILE_NAME, Config, generate_default_config, load_config},
    fetch::HttpFetcher,
    service::PluginService,
    workspace::DevfileWorkspace,
};

use crate::cli::client::{Confirmation, TerminalClient};

pub mod client;
pub mod config;
pub mod plugin;
pub mod registry;

/// Devfile used when the configuration does not name one
pub const DEFAULT_DEVFILE_NAME: &str = "devfile.yaml";

/// A trait that defines the interface for all CLI commands
pub trait CliCommand {
    /// Execute the command with the provided context, returning a structured output
    fn handle(&self, ctx: &CliContext) -> impl Future<Output = anyhow::Result<CommandOutput>>;
}

/// Used for displaying human-readable output vs JSON format
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum OutputKind {
    Text,
    Json,
}

impl std::str::FromStr for OutputKind {
    type Err = OutputParseErr;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "plain" | "text" => Ok(Self::Text),
            _ => Err(OutputParseErr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputParseErr;

impl std::error::Error for OutputParseErr {}

impl std::fmt::Display for OutputParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "error parsing output type, see help for the list of accepted outputs"
        )
    }
}

/// The final output for a plugman CLI command
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    /// The message to display to the user
    message: String,
    /// Whether or not the command was successful
    success: bool,
    /// Additional data that can be included in JSON output
    data: Option<serde_json::Value>,
    /// The kind of output requested (text or JSON)
    #[serde(skip_serializing)]
    output_kind: OutputKind,
}

impl CommandOutput {
    pub fn ok(message: impl ToString, data: Option<serde_json::Value>) -> Self {
        Self {
            message: message.to_string(),
            success: true,
            data,
            output_kind: OutputKind::Text,
        }
    }

    pub fn error(message: impl ToString, data: Option<serde_json::Value>) -> Self {
        Self {
            message: message.to_string(),
            success: false,
            data,
            output_kind: OutputKind::Text,
        }
    }

    pub fn with_output_kind(self, output_kind: OutputKind) -> Self {
        Self {
            output_kind,
            ..self
        }
    }

    /// Render the output as a string, returning the CLI message and whether it was successful
    pub fn render(self) -> (String, bool) {
        (
            match self.output_kind {
                OutputKind::Json => serde_json::to_string_pretty(&self).unwrap_or_else(|e| {
                    // Same structure as CommandOutput
                    json!({
                        "message": "failed to serialize output",
                        "success": false,
                        "data": {
                            "error": e.to_string(),
                        }
                    })
                    .to_string()
                }),
                OutputKind::Text => self.message,
            },
            self.success,
        )
    }
}

/// CliContext holds the global context for the plugman CLI
///
/// It resolves the configuration, data and cache directories following the
/// XDG Base Directory Specification, and knows how to start a plugin session
/// from the loaded configuration.
#[derive(Debug, Clone)]
pub struct CliContext {
    #[cfg(unix)]
    app_strategy: Xdg,
    #[cfg(windows)]
    app_strategy: Windows,
    project_dir: PathBuf,
    user_config: Option<PathBuf>,
    non_interactive: bool,
    show_progress: bool,
}

#[cfg(unix)]
impl Deref for CliContext {
    type Target = Xdg;

    fn deref(&self) -> &Xdg {
        &self.app_strategy
    }
}
#[cfg(windows)]
impl Deref for CliContext {
    type Target = Windows;

    fn deref(&self) -> &Windows {
        &self.app_strategy
    }
}

#[derive(Debug, Default)]
pub struct CliContextBuilder {
    project_dir: Option<PathBuf>,
    user_config: Option<PathBuf>,
    non_interactive: bool,
    show_progress: bool,
}

impl CliContextBuilder {
    pub fn project_dir(self, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: Some(project_dir.into()),
            ..self
        }
    }

    /// Use `path` instead of the XDG configuration file
    pub fn user_config(self, path: impl Into<PathBuf>) -> Self {
        Self {
            user_config: Some(path.into()),
            ..self
        }
    }

    pub fn non_interactive(self, non_interactive: bool) -> Self {
        Self {
            non_interactive,
            ..self
        }
    }

    /// Draw a progress bar while the registry cache is rebuilt
    pub fn show_progress(self, show_progress: bool) -> Self {
        Self {
            show_progress,
            ..self
        }
    }

    pub async fn build(self) -> anyhow::Result<CliContext> {
        let app_strategy = choose_app_strategy(AppStrategyArgs {
            top_level_domain: "io.plugman".to_string(),
            author: "plugman contributors".to_string(),
            app_name: "plugman".to_string(),
        })
        .context("failed to determine file system strategy")?;

        for dir in [
            app_strategy.data_dir(),
            app_strategy.cache_dir(),
            app_strategy.config_dir(),
        ] {
            if dir.exists() {
                trace!(dir = ?dir, "directory already exists, skipping creation");
                continue;
            }
            debug!(dir = ?dir, "creating directory for plugman CLI");
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }

        let project_dir = match self.project_dir {
            Some(dir) => dir,
            None => std::env::current_dir().context("failed to get current dir")?,
        };

        Ok(CliContext {
            app_strategy,
            project_dir,
            user_config: self.user_config,
            non_interactive: self.non_interactive,
            show_progress: self.show_progress,
        })
    }
}

impl CliContext {
    pub fn builder() -> CliContextBuilder {
        CliContextBuilder::default()
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn is_non_interactive(&self) -> bool {
        self.non_interactive
    }

    pub fn config_path(&self) -> PathBuf {
        self.user_config
            .clone()
            .unwrap_or_else(|| self.app_strategy.in_config_dir(CONFIG_FILE_NAME))
    }

    /// Load the plugman configuration, creating the user configuration file
    /// with default values if it does not exist.
    ///
    /// `overrides` only replace the fields they serialize.
    pub async fn ensure_config<T: Serialize>(&self, overrides: Option<T>) -> anyhow::Result<Config> {
        let config_path = self.config_path();

        if !config_path.exists() {
            debug!(
                ?config_path,
                "config file not found, creating with defaults"
            );
            generate_default_config(&config_path, false).await?;
        }

        load_config(&config_path, Some(&self.project_dir), overrides)
    }

    /// Load only the user configuration file, the one registry commands edit
    pub async fn user_config(&self) -> anyhow::Result<Config> {
        let config_path = self.config_path();
        if !config_path.exists() {
            generate_default_config(&config_path, false).await?;
        }
        load_config(&config_path, None, None::<Config>)
    }

    /// Start a plugin session for `config`.
    ///
    /// Dependency questions are answered with yes when `accept_dependencies`
    /// is set, asked on the terminal when interactive, and declined otherwise.
    #[instrument(level = "debug", skip_all)]
    pub async fn plugin_service(
        &self,
        config: &Config,
        accept_dependencies: bool,
    ) -> anyhow::Result<PluginService> {
        let registries = config.registries()?;
        let fetcher = Arc::new(HttpFetcher::new().context("failed to create HTTP client")?);
        let devfile = config
            .workspace
            .devfile
            .clone()
            .unwrap_or_else(|| self.data_dir().join(DEFAULT_DEVFILE_NAME));
        let workspace = Arc::new(DevfileWorkspace::new(devfile));

        let confirmation = if accept_dependencies {
            Confirmation::Accept
        } else if self.non_interactive {
            Confirmation::Decline
        } else {
            Confirmation::Prompt
        };
        let client = Arc::new(TerminalClient::new(confirmation, self.show_progress));

        let mut builder = PluginService::builder(registries, fetcher, workspace, self.data_dir())
            .client(client)
            .verify_artifacts(config.verify_artifacts);
        if let Some(artifacts_dir) = &config.workspace.artifacts_dir {
            builder = builder.artifacts_dir(artifacts_dir);
        }
        if let Some(manifest) = &config.workspace.manifest {
            builder = builder.manifest_path(manifest);
        }
        builder
            .build()
            .await
            .context("failed to start plugin session")
    }
}
