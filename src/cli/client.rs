//! Terminal side of a plugin session: cache progress and dependency prompts

use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use plugman_lib::{PluginKey, cache::CacheEvent, client::PluginClient};

const PROGRESS_TEMPLATE: &str = "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}";

/// How dependency questions are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Accept,
    Decline,
    Prompt,
}

#[derive(Debug)]
pub struct TerminalClient {
    confirmation: Confirmation,
    progress: Option<ProgressBar>,
}

impl TerminalClient {
    pub fn new(confirmation: Confirmation, show_progress: bool) -> Self {
        let progress = show_progress.then(|| {
            let bar = ProgressBar::new(0);
            match ProgressStyle::with_template(PROGRESS_TEMPLATE) {
                Ok(style) => bar.set_style(style.progress_chars("=> ")),
                Err(e) => debug!(err = %e, "invalid progress template, using the default style"),
            }
            bar.set_message("caching plugins");
            bar
        });
        Self {
            confirmation,
            progress,
        }
    }
}

#[async_trait::async_trait]
impl PluginClient for TerminalClient {
    async fn notify(&self, event: CacheEvent) {
        let Some(bar) = &self.progress else {
            return;
        };
        match event {
            CacheEvent::CacheSizeChanged(count) => bar.set_length(count as u64),
            CacheEvent::PluginCached(count) => bar.set_position(count as u64),
            CacheEvent::CachingComplete => bar.finish_and_clear(),
            // Already logged by the cache builder
            CacheEvent::InvalidRegistryFound(_) | CacheEvent::InvalidPluginFound(_) => {}
        }
    }

    async fn ask_to_install_dependencies(&self, dependencies: &[PluginKey]) -> bool {
        let listed = dependencies
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        match self.confirmation {
            Confirmation::Accept => {
                info!(dependencies = %listed, "installing dependencies");
                true
            }
            Confirmation::Decline => {
                warn!(
                    dependencies = %listed,
                    "dependencies need confirmation, pass --yes to install them in non-interactive mode"
                );
                false
            }
            Confirmation::Prompt => {
                if let Some(bar) = &self.progress {
                    bar.finish_and_clear();
                }
                let prompt = format!("The following dependencies will be installed too: {listed}. Continue?");
                let answer = tokio::task::spawn_blocking(move || {
                    Confirm::with_theme(&ColorfulTheme::default())
                        .with_prompt(prompt)
                        .default(true)
                        .interact()
                })
                .await;
                match answer {
                    Ok(Ok(answer)) => answer,
                    Ok(Err(e)) => {
                        warn!(err = ?e, "failed to read dependency confirmation");
                        false
                    }
                    Err(e) => {
                        warn!(err = ?e, "dependency prompt task failed");
                        false
                    }
                }
            }
        }
    }
}
