//! The plugin service: one session over a ledger, a registry cache and the
//! workspace the plugins are committed to.
//!
//! Install, remove and persist requests are serialized through a lock around
//! the ledger, so each one sees the result of the previous one. Cache updates
//! run outside that lock; a newer update cancels the one in flight, and the
//! live cache only ever changes to the result of a completed pass.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use tokio::sync::{Mutex, RwLock};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{
    artifacts::ArtifactStore,
    cache::{CacheBuilder, CachedPlugin, PluginCache, RegistryDescriptors},
    client::{LoggingClient, PluginClient},
    conflict::RemovalPlan,
    error::{PluginError, Result},
    fetch::ArtifactFetcher,
    key::PluginKey,
    ledger::{Ledger, PluginState},
    manifest::{InstalledManifest, MANIFEST_FILE_NAME},
    persist::{Committer, PersistOutcome},
    registry::{Registries, Registry},
    transaction::{self, InstallOutcome, TransactionContext},
    workspace::Workspace,
};

/// State of a listed plugin in the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginStatus {
    Installed,
    PendingInstall,
    PendingRemoval,
    Available,
}

impl From<Option<PluginState>> for PluginStatus {
    fn from(state: Option<PluginState>) -> Self {
        match state {
            Some(PluginState::Installed) => PluginStatus::Installed,
            Some(PluginState::PendingInstall) => PluginStatus::PendingInstall,
            Some(PluginState::PendingRemoval) => PluginStatus::PendingRemoval,
            None => PluginStatus::Available,
        }
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            PluginStatus::Installed => "installed",
            PluginStatus::PendingInstall => "pending install",
            PluginStatus::PendingRemoval => "pending removal",
            PluginStatus::Available => "available",
        };
        f.write_str(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginListing {
    pub plugin: CachedPlugin,
    pub status: PluginStatus,
}

/// Changes staged but not yet committed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedChanges {
    pub to_install: Vec<PluginKey>,
    pub to_remove: Vec<PluginKey>,
}

impl StagedChanges {
    pub fn is_empty(&self) -> bool {
        self.to_install.is_empty() && self.to_remove.is_empty()
    }
}

pub struct PluginService {
    ledger: Mutex<Ledger>,
    cache: RwLock<Arc<PluginCache>>,
    registries: RwLock<Registries>,
    fetcher: Arc<dyn ArtifactFetcher>,
    workspace: Arc<dyn Workspace>,
    client: Arc<dyn PluginClient>,
    store: ArtifactStore,
    manifest_path: PathBuf,
    verify_artifacts: bool,
    cache_update: StdMutex<CancellationToken>,
}

impl PluginService {
    pub fn builder(
        registries: Registries,
        fetcher: Arc<dyn ArtifactFetcher>,
        workspace: Arc<dyn Workspace>,
        data_dir: impl Into<PathBuf>,
    ) -> PluginServiceBuilder {
        PluginServiceBuilder::new(registries, fetcher, workspace, data_dir)
    }

    /// Rebuild the registry cache, forwarding every event to the client.
    ///
    /// Returns the number of cached plugins. Starting another update while
    /// this one runs makes this one return [`crate::PluginError::Cancelled`]
    /// without touching the live cache.
    #[instrument(level = "debug", skip_all)]
    pub async fn update_cache(&self) -> Result<usize> {
        let cancel = CancellationToken::new();
        if let Ok(mut current) = self.cache_update.lock() {
            let previous = std::mem::replace(&mut *current, cancel.clone());
            previous.cancel();
        }

        let registries = self.registries.read().await.clone();
        let mut update =
            CacheBuilder::new(self.fetcher.clone()).spawn(registries, cancel.clone());
        while let Some(event) = update.events.next().await {
            self.client.notify(event).await;
        }
        let cache = update.finish().await?;

        // A newer update cancels this token before it can swap its own cache
        let mut live = self.cache.write().await;
        if cancel.is_cancelled() {
            debug!("cache update superseded after completing, discarding it");
            return Err(PluginError::Cancelled);
        }
        let count = cache.len();
        *live = Arc::new(cache);
        debug!(count, "live plugin cache replaced");
        Ok(count)
    }

    /// Cancel a cache update in flight, if any
    pub fn cancel_cache_update(&self) {
        if let Ok(current) = self.cache_update.lock() {
            current.cancel();
        }
    }

    /// Stage `key` and its missing dependencies for installation
    pub async fn install(&self, key: &PluginKey) -> Result<InstallOutcome> {
        let mut ledger = self.ledger.lock().await;
        let cache = self.cache().await;
        let default = self.registries.read().await.default_registry().clone();
        let source = RegistryDescriptors::new(&cache, &default, self.fetcher.as_ref());
        let ctx = self.transaction_context(&source, &cache);
        transaction::install(&mut ledger, key, &ctx).await
    }

    /// Stage `key` for removal, along with dependents no registry lists anymore
    pub async fn remove(&self, key: &PluginKey) -> Result<RemovalPlan> {
        let mut ledger = self.ledger.lock().await;
        let cache = self.cache().await;
        let default = self.registries.read().await.default_registry().clone();
        let source = RegistryDescriptors::new(&cache, &default, self.fetcher.as_ref());
        let ctx = self.transaction_context(&source, &cache);
        transaction::remove(&mut ledger, key, &ctx).await
    }

    /// Commit every staged change
    pub async fn persist(&self) -> Result<PersistOutcome> {
        let mut ledger = self.ledger.lock().await;
        let cache = self.cache().await;
        let default = self.registries.read().await.default_registry().clone();
        let source = RegistryDescriptors::new(&cache, &default, self.fetcher.as_ref());
        let committer = Committer {
            source: &source,
            fetcher: self.fetcher.as_ref(),
            store: &self.store,
            workspace: self.workspace.as_ref(),
            manifest_path: &self.manifest_path,
        };
        committer.persist(&mut ledger).await
    }

    fn transaction_context<'a>(
        &'a self,
        source: &'a RegistryDescriptors<'a>,
        cache: &'a PluginCache,
    ) -> TransactionContext<'a> {
        TransactionContext {
            source,
            cache,
            fetcher: self.fetcher.as_ref(),
            client: self.client.as_ref(),
            verify_artifacts: self.verify_artifacts,
        }
    }

    /// Every cached plugin with its state in this session
    pub async fn plugins(&self) -> Vec<PluginListing> {
        let ledger = self.ledger.lock().await;
        self.cache()
            .await
            .iter()
            .map(|plugin| PluginListing {
                status: ledger.state(&plugin.key()).into(),
                plugin: plugin.clone(),
            })
            .collect()
    }

    /// Plugins installed in the workspace, including those pending removal
    pub async fn installed_plugins(&self) -> Vec<PluginKey> {
        let ledger = self.ledger.lock().await;
        ledger
            .installed()
            .iter()
            .chain(ledger.to_remove())
            .cloned()
            .collect()
    }

    pub async fn staged_changes(&self) -> StagedChanges {
        let ledger = self.ledger.lock().await;
        StagedChanges {
            to_install: ledger.to_install().to_vec(),
            to_remove: ledger.to_remove().to_vec(),
        }
    }

    /// Snapshot of the ledger
    pub async fn ledger(&self) -> Ledger {
        self.ledger.lock().await.clone()
    }

    /// The live cache
    pub async fn cache(&self) -> Arc<PluginCache> {
        self.cache.read().await.clone()
    }

    pub async fn registries(&self) -> Registries {
        self.registries.read().await.clone()
    }

    /// Add or replace a registry. Takes effect on the next cache update.
    pub async fn add_registry(&self, registry: Registry) {
        info!(registry = %registry.name, uri = %registry.internal_uri, "registry added");
        self.registries.write().await.insert(registry);
    }

    pub async fn remove_registry(&self, name: &str) -> Result<Registry> {
        let removed = self.registries.write().await.remove(name)?;
        info!(registry = %name, "registry removed");
        Ok(removed)
    }

    pub async fn set_default_registry(&self, name: &str) -> Result<()> {
        self.registries.write().await.set_default(name)?;
        info!(registry = %name, "default registry changed");
        Ok(())
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.store
    }
}

pub struct PluginServiceBuilder {
    registries: Registries,
    fetcher: Arc<dyn ArtifactFetcher>,
    workspace: Arc<dyn Workspace>,
    client: Arc<dyn PluginClient>,
    artifacts_dir: PathBuf,
    manifest_path: PathBuf,
    verify_artifacts: bool,
}

impl PluginServiceBuilder {
    /// Artifacts and the manifest default to locations under `data_dir`
    pub fn new(
        registries: Registries,
        fetcher: Arc<dyn ArtifactFetcher>,
        workspace: Arc<dyn Workspace>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.into();
        Self {
            registries,
            fetcher,
            workspace,
            client: Arc::new(LoggingClient::new(false)),
            artifacts_dir: data_dir.join("artifacts"),
            manifest_path: data_dir.join(MANIFEST_FILE_NAME),
            verify_artifacts: true,
        }
    }

    pub fn client(self, client: Arc<dyn PluginClient>) -> Self {
        Self { client, ..self }
    }

    pub fn artifacts_dir(self, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            ..self
        }
    }

    pub fn manifest_path(self, manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            ..self
        }
    }

    pub fn verify_artifacts(self, verify_artifacts: bool) -> Self {
        Self {
            verify_artifacts,
            ..self
        }
    }

    /// Start a session from the installed-plugin manifest
    pub async fn build(self) -> Result<PluginService> {
        let manifest = InstalledManifest::load(&self.manifest_path).await?;
        let ledger = Ledger::new(manifest.keys());
        debug!(
            installed = ledger.installed().len(),
            manifest = %self.manifest_path.display(),
            "plugin session started"
        );
        Ok(PluginService {
            ledger: Mutex::new(ledger),
            cache: RwLock::new(Arc::new(PluginCache::default())),
            registries: RwLock::new(self.registries),
            fetcher: self.fetcher,
            workspace: self.workspace,
            client: self.client,
            store: ArtifactStore::new(self.artifacts_dir),
            manifest_path: self.manifest_path,
            verify_artifacts: self.verify_artifacts,
            cache_update: StdMutex::new(CancellationToken::new()),
        })
    }
}
