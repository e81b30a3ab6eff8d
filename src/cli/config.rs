use anyhow::Context as _;
use clap::Subcommand;
use etcetera::AppStrategy as _;
use tracing::instrument;

use plugman_lib::config::{Config, generate_default_config, local_config_path};

use crate::{
    CARGO_PKG_VERSION,
    cli::{CliCommand, CliContext, CommandOutput},
};

/// View and initialize plugman configuration
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Initialize a new configuration file for plugman
    Init {
        #[clap(long)]
        /// Overwrite existing configuration
        force: bool,
        #[clap(long)]
        /// Write the user configuration instead of the project one
        global: bool,
    },
    /// Print the current version and local directories used by plugman
    Info {},
    /// Print the merged configuration
    Show {},
}

impl CliCommand for ConfigCommand {
    #[instrument(level = "debug", skip_all, name = "config")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        match self {
            ConfigCommand::Init { force, global } => {
                let config_path = if *global {
                    ctx.config_path()
                } else {
                    local_config_path(ctx.project_dir())
                };

                generate_default_config(&config_path, *force)
                    .await
                    .context("failed to initialize config")?;

                Ok(CommandOutput::ok(
                    format!(
                        "Configuration initialized at {}",
                        config_path.display()
                    ),
                    Some(serde_json::json!({
                        "config_path": config_path.display().to_string(),
                    })),
                ))
            }
            ConfigCommand::Info {} => {
                let data_dir = ctx.data_dir().display().to_string();
                let cache_dir = ctx.cache_dir().display().to_string();
                let config_dir = ctx.config_dir().display().to_string();
                let config_path = ctx.config_path().display().to_string();
                let project_config = local_config_path(ctx.project_dir()).display().to_string();

                Ok(CommandOutput::ok(
                    format!(
                        "plugman version: {CARGO_PKG_VERSION}\nData directory: {data_dir}\nCache directory: {cache_dir}\nConfig directory: {config_dir}\nConfig path: {config_path}\nProject config path: {project_config}"
                    ),
                    Some(serde_json::json!({
                        "version": CARGO_PKG_VERSION,
                        "data_dir": data_dir,
                        "cache_dir": cache_dir,
                        "config_dir": config_dir,
                        "config_path": config_path,
                        "project_config_path": project_config,
                    })),
                ))
            }
            ConfigCommand::Show {} => {
                let config = ctx
                    .ensure_config(None::<Config>)
                    .await
                    .context("failed to load config")?;
                Ok(CommandOutput::ok(
                    serde_json::to_string_pretty(&config).context("failed to serialize config")?,
                    Some(serde_json::to_value(&config).context("failed to serialize config")?),
                ))
            }
        }
    }
}
