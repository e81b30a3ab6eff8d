use anyhow::Context as _;
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument};

use plugman_lib::{
    PluginKey,
    config::Config,
    persist::PersistOutcome,
    service::{PluginListing, PluginService},
};

use crate::cli::{CliCommand, CliContext, CommandOutput};

/// Manage the plugins installed in the workspace
#[derive(Subcommand, Debug, Clone)]
pub enum PluginCommand {
    /// List the plugins the configured registries offer
    List(ListCommand),
    /// Install plugins along with their dependencies
    Install(InstallCommand),
    /// Remove plugins, along with dependents no registry lists anymore
    Remove(RemoveCommand),
}

impl CliCommand for PluginCommand {
    #[instrument(level = "debug", skip_all, name = "plugin")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        match self {
            PluginCommand::List(cmd) => cmd.handle(ctx).await,
            PluginCommand::Install(cmd) => cmd.handle(ctx).await,
            PluginCommand::Remove(cmd) => cmd.handle(ctx).await,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ListCommand {
    /// Only list installed plugins, without contacting any registry
    #[clap(long)]
    installed: bool,
}

impl CliCommand for ListCommand {
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        let config = ctx.ensure_config(None::<Config>).await?;
        let service = ctx.plugin_service(&config, false).await?;

        if self.installed {
            let installed = service.installed_plugins().await;
            let message = if installed.is_empty() {
                "No plugins installed".to_string()
            } else {
                installed
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            return Ok(CommandOutput::ok(
                message,
                Some(json!({ "plugins": installed })),
            ));
        }

        service
            .update_cache()
            .await
            .context("failed to update plugin cache")?;
        let listings = service.plugins().await;
        let message = if listings.is_empty() {
            "No plugins found in the configured registries".to_string()
        } else {
            listings
                .iter()
                .map(|listing| {
                    format!(
                        "{key}\t{status}\t{title}",
                        key = listing.plugin.key(),
                        status = listing.status,
                        title = listing.plugin.descriptor.title(),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let plugins = listings.iter().map(listing_json).collect::<Vec<_>>();
        Ok(CommandOutput::ok(message, Some(json!({ "plugins": plugins }))))
    }
}

fn listing_json(listing: &PluginListing) -> serde_json::Value {
    let metadata = &listing.plugin.descriptor.metadata;
    json!({
        "id": listing.plugin.key(),
        "title": listing.plugin.descriptor.title(),
        "description": metadata.description,
        "registry": listing.plugin.registry,
        "icon": listing.plugin.icon_url,
        "status": listing.status,
    })
}

/// Command line overrides for the loaded configuration
#[derive(Debug, Default, Serialize)]
struct InstallOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    verify_artifacts: Option<bool>,
}

#[derive(Args, Debug, Clone)]
pub struct InstallCommand {
    /// Plugins to install, as publisher/name or publisher/name/version
    #[clap(required = true, value_name = "KEY")]
    keys: Vec<PluginKey>,

    /// Install listed dependencies without asking
    #[clap(short = 'y', long)]
    yes: bool,

    /// Skip checking that extension artifacts are reachable before staging
    #[clap(long)]
    no_verify: bool,
}

impl CliCommand for InstallCommand {
    #[instrument(level = "debug", skip_all, name = "install")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        let overrides = InstallOverrides {
            verify_artifacts: self.no_verify.then_some(false),
        };
        let config = ctx.ensure_config(Some(overrides)).await?;
        let service = ctx.plugin_service(&config, self.yes).await?;
        service
            .update_cache()
            .await
            .context("failed to update plugin cache")?;

        let mut requested = Vec::new();
        for key in &self.keys {
            let outcome = service
                .install(key)
                .await
                .with_context(|| format!("failed to install {key}"))?;
            if outcome.is_noop() {
                info!(key = %key, "plugin already installed");
            }
            requested.push(json!({
                "key": key,
                "staged": outcome.staged,
                "restored": outcome.restored,
            }));
        }

        commit(&service, requested).await
    }
}

#[derive(Args, Debug, Clone)]
pub struct RemoveCommand {
    /// Plugins to remove, as publisher/name or publisher/name/version
    #[clap(required = true, value_name = "KEY")]
    keys: Vec<PluginKey>,
}

impl CliCommand for RemoveCommand {
    #[instrument(level = "debug", skip_all, name = "remove")]
    async fn handle(&self, ctx: &CliContext) -> anyhow::Result<CommandOutput> {
        let config = ctx.ensure_config(None::<Config>).await?;
        let service = ctx.plugin_service(&config, false).await?;
        service
            .update_cache()
            .await
            .context("failed to update plugin cache")?;

        let mut requested = Vec::new();
        for key in &self.keys {
            let plan = service
                .remove(key)
                .await
                .with_context(|| format!("failed to remove {key}"))?;
            requested.push(json!({
                "key": key,
                "staged": plan.stage_removal,
                "unstaged": plan.unstage_install,
            }));
        }

        commit(&service, requested).await
    }
}

/// Persist whatever the session staged and describe the result
async fn commit(
    service: &PluginService,
    requested: Vec<serde_json::Value>,
) -> anyhow::Result<CommandOutput> {
    let outcome = service
        .persist()
        .await
        .context("failed to commit plugin changes")?;
    Ok(CommandOutput::ok(
        summary(&outcome),
        Some(json!({
            "requested": requested,
            "installed": outcome.installed,
            "removed": outcome.removed,
            "downloaded": outcome.downloaded,
            "deleted": outcome.deleted,
            "workspace_patched": outcome.workspace_patched,
            "restarted": outcome.restarted,
            "warnings": outcome.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
        })),
    ))
}

fn summary(outcome: &PersistOutcome) -> String {
    if outcome.is_noop() {
        return "Nothing to change".to_string();
    }
    let mut lines = Vec::new();
    if !outcome.installed.is_empty() {
        lines.push(format!("Installed {}", join_keys(&outcome.installed)));
    }
    if !outcome.removed.is_empty() {
        lines.push(format!("Removed {}", join_keys(&outcome.removed)));
    }
    if outcome.restarted {
        lines.push("Workspace restart requested".to_string());
    }
    lines.extend(
        outcome
            .warnings
            .iter()
            .map(|warning| format!("warning: {warning}")),
    );
    lines.join("\n")
}

fn join_keys(keys: &[PluginKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
