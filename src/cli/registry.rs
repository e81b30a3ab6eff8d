use anyhow::Context as _;
use clap::Subcommand;
use serde_json::json;
use tracing::instrument;
use url::Url;

use plugman_lib::{
    config::save_config,
    registry::{Registries, Registry},
};

use crate::cli::{CliCommand, CliContext, CommandOutput};

/// Manage the plugin registries of the user configuration
#[derive(Subcommand, Debug, Clone)]
pub enum RegistryCommand {
    /// List configured registries
    List {},
    /// Add a registry, replacing any registry with the same name
    Add {
        /// Name of the registry
        name: String,
        /// URI plugins are fetched from
        uri: Url,
        /// URI icons are linked from, when it differs from the fetch URI
        #[clap(long)]
        public_uri: Option<Url>,
        /// Make the new registry the default one
        #[clap(long)]
        default: bool,
    },
    /// Remove a registry
    Remove {
        /// Name of the registry
        name: String,
    },
    /// Set the registry plugins missing from the cache are fetched from
    Default {
        /// Name of the registry
        name: String,
    },
}

impl CliCommand for RegistryCommand {
    #[instrument(level = "debug", skip_all, name = "registry")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        let mut config = ctx.user_config().await?;
        let mut registries = config.registries()?;

        let message = match self {
            RegistryCommand::List {} => {
                return Ok(CommandOutput::ok(
                    describe(&registries),
                    Some(registries_json(&registries)),
                ));
            }
            RegistryCommand::Add {
                name,
                uri,
                public_uri,
                default,
            } => {
                let mut registry = Registry::new(name, uri.clone());
                if let Some(public_uri) = public_uri {
                    registry = registry.with_public_uri(public_uri.clone());
                }
                registries.insert(registry);
                if *default {
                    registries.set_default(name)?;
                }
                format!("Registry '{name}' added")
            }
            RegistryCommand::Remove { name } => {
                registries
                    .remove(name)
                    .with_context(|| format!("failed to remove registry '{name}'"))?;
                format!("Registry '{name}' removed")
            }
            RegistryCommand::Default { name } => {
                registries.set_default(name)?;
                format!("Default registry set to '{name}'")
            }
        };

        config.set_registries(&registries);
        save_config(&config, &ctx.config_path())
            .await
            .context("failed to save configuration")?;
        Ok(CommandOutput::ok(message, Some(registries_json(&registries))))
    }
}

fn describe(registries: &Registries) -> String {
    let default = &registries.default_registry().name;
    registries
        .iter()
        .map(|registry| {
            let marker = if &registry.name == default { "*" } else { " " };
            format!(
                "{marker} {name}\t{uri}",
                name = registry.name,
                uri = registry.internal_uri
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn registries_json(registries: &Registries) -> serde_json::Value {
    json!({
        "default": registries.default_registry().name,
        "registries": registries.iter().collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_marks_default_registry() {
        let mut registries = Registries::new(Registry::new(
            "default",
            Url::parse("https://registry.example.com/v3").unwrap(),
        ));
        registries.insert(Registry::new(
            "internal",
            Url::parse("https://registry.internal/v3").unwrap(),
        ));

        let described = describe(&registries);
        assert!(described.contains("* default\thttps://registry.example.com/v3"));
        assert!(described.contains("  internal\thttps://registry.internal/v3"));
    }
}
