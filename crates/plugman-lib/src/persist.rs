//! Committing staged changes to disk and to the workspace.
//!
//! A commit downloads artifacts of staged installs, removes artifacts of
//! staged removals, patches the dev container attributes, writes the
//! installed-plugin manifest and finally asks the workspace to restart. Every
//! step that touches persisted state records how to undo it; when a later
//! step fails, the recorded compensations run in reverse and the ledger is
//! left uncommitted.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    artifacts::{ArtifactStore, Trash},
    cache::DescriptorSource,
    descriptor::PluginDescriptor,
    error::{FetchError, PluginError, Result},
    fetch::ArtifactFetcher,
    key::PluginKey,
    ledger::Ledger,
    manifest::InstalledManifest,
    workspace::{Component, Workspace, select_dev_container},
};

/// Something worth telling the user about a commit that still succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistWarning {
    /// Several components qualified as the dev container and the first was used
    AmbiguousDevContainer {
        chosen: String,
        passed_over: Vec<String>,
    },
    /// The commit went through but the workspace could not be restarted
    RestartFailed { message: String },
}

impl std::fmt::Display for PersistWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistWarning::AmbiguousDevContainer {
                chosen,
                passed_over,
            } => write!(
                f,
                "several components qualify as the dev container, used '{chosen}' over {}",
                passed_over.join(", ")
            ),
            PersistWarning::RestartFailed { message } => {
                write!(f, "workspace restart failed: {message}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub installed: Vec<PluginKey>,
    pub removed: Vec<PluginKey>,
    /// Artifact files written by this commit
    pub downloaded: Vec<PathBuf>,
    /// Artifact files deleted by this commit
    pub deleted: Vec<PathBuf>,
    pub workspace_patched: bool,
    pub restarted: bool,
    pub warnings: Vec<PersistWarning>,
}

impl PersistOutcome {
    /// Whether the commit had nothing to do
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty() && self.removed.is_empty()
    }
}

/// Undo log of a commit in progress
#[derive(Default)]
struct Compensations {
    downloaded: Vec<PathBuf>,
    trash: Option<Trash>,
    original_components: Option<Vec<Component>>,
}

impl Compensations {
    async fn run(self, store: &ArtifactStore, workspace: &dyn Workspace) {
        if let Some(components) = self.original_components {
            if let Err(e) = workspace.patch_components(components).await {
                warn!(err = ?e, "failed to restore workspace components");
            }
        }
        if let Some(trash) = self.trash {
            trash.restore().await;
        }
        for path in self.downloaded.iter().rev() {
            if let Err(e) = store.delete(path).await {
                warn!(path = %path.display(), err = %e, "failed to delete downloaded artifact");
            }
        }
        debug!("commit rolled back");
    }
}

/// Applies a ledger's staged changes
pub struct Committer<'a> {
    pub source: &'a dyn DescriptorSource,
    pub fetcher: &'a dyn ArtifactFetcher,
    pub store: &'a ArtifactStore,
    pub workspace: &'a dyn Workspace,
    pub manifest_path: &'a Path,
}

impl Committer<'_> {
    /// Commit the staged changes of `ledger`. The ledger is only drained once
    /// every persisted write succeeded; on error it is left as it was and any
    /// persisted change made so far is undone.
    #[instrument(level = "debug", skip_all)]
    pub async fn persist(&self, ledger: &mut Ledger) -> Result<PersistOutcome> {
        if !ledger.has_staged_changes() {
            debug!("nothing staged, skipping commit");
            return Ok(PersistOutcome::default());
        }

        let installs = self.descriptors(ledger.to_install()).await?;
        let removals = self.descriptors(ledger.to_remove()).await?;

        let mut undo = Compensations::default();
        let mut outcome = PersistOutcome {
            installed: ledger.to_install().to_vec(),
            removed: ledger.to_remove().to_vec(),
            ..Default::default()
        };

        if let Err(e) = self
            .apply(&installs, &removals, ledger, &mut undo, &mut outcome)
            .await
        {
            undo.run(self.store, self.workspace).await;
            return Err(e);
        }

        // Dropping the trash deletes the removed artifacts for good
        drop(undo);
        ledger.commit();
        info!(
            installed = outcome.installed.len(),
            removed = outcome.removed.len(),
            "staged plugin changes committed"
        );

        match self.workspace.restart().await {
            Ok(()) => outcome.restarted = true,
            Err(e) => {
                warn!(err = ?e, "workspace restart failed after commit");
                outcome.warnings.push(PersistWarning::RestartFailed {
                    message: format!("{e:#}"),
                });
            }
        }
        Ok(outcome)
    }

    async fn descriptors(&self, keys: &[PluginKey]) -> Result<Vec<PluginDescriptor>> {
        let mut descriptors = Vec::with_capacity(keys.len());
        for key in keys {
            descriptors.push(self.source.descriptor(key).await?);
        }
        Ok(descriptors)
    }

    async fn apply(
        &self,
        installs: &[PluginDescriptor],
        removals: &[PluginDescriptor],
        ledger: &Ledger,
        undo: &mut Compensations,
        outcome: &mut PersistOutcome,
    ) -> Result<()> {
        let kept = self.download(installs, undo, outcome).await?;
        self.clean_up(removals, &kept, undo, outcome).await?;
        self.patch_dev_container(installs, removals, undo, outcome)
            .await?;

        InstalledManifest::from_keys(&ledger.installed_after_commit())
            .save(self.manifest_path)
            .await
    }

    /// Download every missing artifact of `installs`, in order. Returns the
    /// paths the installs need so the cleanup never deletes one of them.
    async fn download(
        &self,
        installs: &[PluginDescriptor],
        undo: &mut Compensations,
        outcome: &mut PersistOutcome,
    ) -> Result<HashSet<PathBuf>> {
        let mut needed = HashSet::new();
        for descriptor in installs {
            let key = descriptor.key();
            for extension in &descriptor.extensions {
                let url = parse_artifact_url(&key, extension)?;
                let path = self.store.path_for(descriptor, &url);
                needed.insert(path.clone());
                if self.store.contains(&path).await {
                    debug!(key = %key, path = %path.display(), "artifact already present");
                    continue;
                }
                let bytes = self.fetcher.fetch(&url).await.map_err(|e| {
                    warn!(key = %key, url = %url, err = %e, "artifact download failed");
                    PluginError::Download {
                        key: key.clone(),
                        url: extension.clone(),
                        source: e,
                    }
                })?;
                self.store.write(&path, &bytes).await?;
                undo.downloaded.push(path.clone());
                outcome.downloaded.push(path);
            }
        }
        Ok(needed)
    }

    async fn clean_up(
        &self,
        removals: &[PluginDescriptor],
        kept: &HashSet<PathBuf>,
        undo: &mut Compensations,
        outcome: &mut PersistOutcome,
    ) -> Result<()> {
        for descriptor in removals {
            let key = descriptor.key();
            for extension in &descriptor.extensions {
                let Ok(url) = Url::parse(extension) else {
                    debug!(key = %key, url = %extension, "skipping malformed artifact url");
                    continue;
                };
                let path = self.store.path_for(descriptor, &url);
                if kept.contains(&path) {
                    continue;
                }
                if undo.trash.is_none() {
                    undo.trash = Some(self.store.trash().await?);
                }
                let Some(trash) = undo.trash.as_mut() else {
                    continue;
                };
                if trash.discard(&path).await? {
                    debug!(key = %key, path = %path.display(), "artifact removed");
                    outcome.deleted.push(path);
                }
            }
        }
        Ok(())
    }

    /// Apply extension and preference changes to the dev container. The
    /// workspace is only read when some descriptor contributes to it, and only
    /// written when an attribute actually changed.
    async fn patch_dev_container(
        &self,
        installs: &[PluginDescriptor],
        removals: &[PluginDescriptor],
        undo: &mut Compensations,
        outcome: &mut PersistOutcome,
    ) -> Result<()> {
        let contributes = installs
            .iter()
            .any(PluginDescriptor::contributes_to_dev_container)
            || removals.iter().any(|d| !d.extensions.is_empty());
        if !contributes {
            return Ok(());
        }

        let original = self
            .workspace
            .components()
            .await
            .map_err(PluginError::Workspace)?;
        let dev_container = select_dev_container(&original)?;
        if !dev_container.passed_over.is_empty() {
            outcome.warnings.push(PersistWarning::AmbiguousDevContainer {
                chosen: original[dev_container.index].name.clone(),
                passed_over: dev_container.passed_over.clone(),
            });
        }

        let mut components = original.clone();
        let component = &mut components[dev_container.index];
        let mut changed = false;
        for descriptor in installs {
            changed |= component.add_extensions(&descriptor.extensions);
            changed |= component.merge_preferences(&descriptor.preferences);
        }
        // An extension an install of this batch still declares stays listed
        let installed_urls: HashSet<&String> =
            installs.iter().flat_map(|d| &d.extensions).collect();
        for descriptor in removals {
            let dropped = descriptor
                .extensions
                .iter()
                .filter(|url| !installed_urls.contains(url))
                .cloned()
                .collect::<Vec<_>>();
            changed |= component.remove_extensions(&dropped);
        }
        if !changed {
            debug!(component = %component.name, "dev container already up to date");
            return Ok(());
        }

        debug!(component = %component.name, "patching dev container attributes");
        self.workspace
            .patch_components(components)
            .await
            .map_err(PluginError::Workspace)?;
        undo.original_components = Some(original);
        outcome.workspace_patched = true;
        Ok(())
    }
}

fn parse_artifact_url(key: &PluginKey, extension: &str) -> Result<Url> {
    Url::parse(extension).map_err(|e| PluginError::Download {
        key: key.clone(),
        url: extension.to_string(),
        source: FetchError::InvalidUrl {
            url: extension.to_string(),
            source: e,
        },
    })
}
