//! Registry cache building.
//!
//! A cache pass walks every registry, downloads its plugin index and then
//! every descriptor the index points at. Broken registries and broken
//! descriptors are reported as events and skipped; they never abort the pass.
//! The resulting [`PluginCache`] replaces the previous one wholesale.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::{
    descriptor::{PluginDescriptor, DESCRIPTOR_FILE_NAME},
    error::{FetchError, PluginError, Result},
    fetch::ArtifactFetcher,
    key::PluginKey,
    registry::{Registries, Registry},
};

/// Progress and non-fatal errors of a cache pass, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Total number of index entries discovered so far
    CacheSizeChanged(usize),
    /// Number of descriptors cached so far
    PluginCached(usize),
    /// The pass finished across all registries
    CachingComplete,
    /// A registry whose index could not be fetched or is not a list
    InvalidRegistryFound(Registry),
    /// A descriptor that could not be fetched or parsed
    InvalidPluginFound(Url),
}

/// A descriptor together with where it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPlugin {
    pub registry: String,
    pub descriptor_url: Url,
    /// Icon link resolved against the registry's public URI
    pub icon_url: Option<Url>,
    pub descriptor: PluginDescriptor,
}

impl CachedPlugin {
    pub fn key(&self) -> PluginKey {
        self.descriptor.key()
    }
}

/// Flat, ordered collection of every plugin listed by the configured registries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginCache {
    plugins: Vec<CachedPlugin>,
}

impl PluginCache {
    pub fn get(&self, key: &PluginKey) -> Option<&CachedPlugin> {
        self.plugins.iter().find(|plugin| &plugin.key() == key)
    }

    /// Whether `key` is still listed by any registry
    pub fn contains(&self, key: &PluginKey) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CachedPlugin> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl FromIterator<CachedPlugin> for PluginCache {
    fn from_iter<T: IntoIterator<Item = CachedPlugin>>(iter: T) -> Self {
        Self {
            plugins: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    id: String,
    #[serde(default)]
    links: IndexLinks,
}

#[derive(Debug, Default, Deserialize)]
struct IndexLinks {
    #[serde(rename = "self")]
    descriptor: Option<String>,
}

/// Builds a [`PluginCache`] from a set of registries
#[derive(Clone)]
pub struct CacheBuilder {
    fetcher: Arc<dyn ArtifactFetcher>,
}

/// A cache pass running in the background
pub struct CacheUpdate {
    /// Progress events, ending with [`CacheEvent::CachingComplete`] unless the pass was cancelled
    pub events: UnboundedReceiverStream<CacheEvent>,
    handle: JoinHandle<Result<PluginCache>>,
}

impl CacheUpdate {
    /// Wait for the pass to finish. A panic in the pass is propagated to the caller.
    pub async fn finish(self) -> Result<PluginCache> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!("cache update task panicked");
                std::panic::resume_unwind(e.into_panic())
            }
            Err(e) => {
                debug!(error = %e, "cache update task aborted");
                Err(PluginError::Cancelled)
            }
        }
    }
}

impl CacheBuilder {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { fetcher }
    }

    /// Run a cache pass on a background task, streaming its events
    pub fn spawn(&self, registries: Registries, cancel: CancellationToken) -> CacheUpdate {
        let (tx, rx) = mpsc::unbounded_channel();
        let builder = self.clone();
        let handle = tokio::spawn(async move { builder.build(&registries, &tx, &cancel).await });
        CacheUpdate {
            events: UnboundedReceiverStream::new(rx),
            handle,
        }
    }

    /// Run a cache pass, emitting progress on `events`.
    ///
    /// The default registry is walked first; when several registries list
    /// the same plugin the first one wins. Returns [`PluginError::Cancelled`]
    /// as soon as `cancel` fires.
    #[instrument(level = "debug", skip_all, name = "update_cache")]
    pub async fn build(
        &self,
        registries: &Registries,
        events: &mpsc::UnboundedSender<CacheEvent>,
        cancel: &CancellationToken,
    ) -> Result<PluginCache> {
        let default = registries.default_registry();
        let ordered = std::iter::once(default)
            .chain(registries.iter().filter(|r| r.name != default.name));

        let mut plugins: Vec<CachedPlugin> = Vec::new();
        let mut discovered = 0usize;
        for registry in ordered {
            let Some(entries) = self.fetch_index(registry, cancel).await? else {
                warn!(registry = %registry.name, "registry index is not a valid plugin list");
                emit(events, CacheEvent::InvalidRegistryFound(registry.clone()));
                continue;
            };
            discovered += entries.len();
            emit(events, CacheEvent::CacheSizeChanged(discovered));

            for entry in entries {
                let Some(descriptor_url) = descriptor_url(registry, &entry) else {
                    warn!(registry = %registry.name, id = %entry.id, "index entry has an unusable descriptor link");
                    continue;
                };
                let Some(descriptor) = self.fetch_descriptor(&descriptor_url, cancel).await? else {
                    emit(events, CacheEvent::InvalidPluginFound(descriptor_url));
                    continue;
                };
                if plugins.iter().any(|p| p.key() == descriptor.key()) {
                    debug!(key = %descriptor.key(), registry = %registry.name, "plugin already cached from another registry");
                    continue;
                }
                let icon_url = descriptor
                    .metadata
                    .icon
                    .as_deref()
                    .and_then(|icon| registry.public_link(icon).ok());
                plugins.push(CachedPlugin {
                    registry: registry.name.clone(),
                    descriptor_url,
                    icon_url,
                    descriptor,
                });
                emit(events, CacheEvent::PluginCached(plugins.len()));
            }
        }

        info!(count = plugins.len(), "plugin cache updated");
        emit(events, CacheEvent::CachingComplete);
        Ok(PluginCache { plugins })
    }

    /// `Ok(None)` marks an invalid registry
    async fn fetch_index(
        &self,
        registry: &Registry,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<IndexEntry>>> {
        let Ok(url) = registry.index_url() else {
            return Ok(None);
        };
        let bytes = match cancellable(cancel, self.fetcher.fetch(&url)).await? {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(registry = %registry.name, error = %e, "failed to fetch registry index");
                return Ok(None);
            }
        };
        Ok(serde_json::from_slice::<Vec<IndexEntry>>(&bytes).ok())
    }

    /// `Ok(None)` marks an invalid plugin
    async fn fetch_descriptor(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<Option<PluginDescriptor>> {
        match cancellable(cancel, self.fetcher.fetch(url)).await? {
            Ok(bytes) => match PluginDescriptor::parse(&bytes, url.as_str()) {
                Ok(descriptor) => Ok(Some(descriptor)),
                Err(e) => {
                    warn!(url = %url, error = %e, "invalid plugin descriptor");
                    Ok(None)
                }
            },
            Err(e) => {
                warn!(url = %url, error = %e, "failed to fetch plugin descriptor");
                Ok(None)
            }
        }
    }
}

fn descriptor_url(registry: &Registry, entry: &IndexEntry) -> Option<Url> {
    match entry.links.descriptor.as_deref() {
        Some(link) => registry.resolve_link(link).ok(),
        None => registry
            .base_url()
            .and_then(|base| base.join(&format!("{}/{DESCRIPTOR_FILE_NAME}", entry.id)))
            .ok(),
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("cache update cancelled");
            Err(PluginError::Cancelled)
        }
        value = fut => Ok(value),
    }
}

fn emit(events: &mpsc::UnboundedSender<CacheEvent>, event: CacheEvent) {
    // A dropped receiver only means nobody is watching progress
    let _ = events.send(event);
}

/// Lookup of full plugin descriptors by key
#[async_trait::async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn descriptor(&self, key: &PluginKey) -> Result<PluginDescriptor>;
}

/// Descriptors served from the live cache, falling back to a direct fetch
/// from the default registry for plugins the cache does not list
pub struct RegistryDescriptors<'a> {
    cache: &'a PluginCache,
    registry: &'a Registry,
    fetcher: &'a dyn ArtifactFetcher,
}

impl<'a> RegistryDescriptors<'a> {
    pub fn new(
        cache: &'a PluginCache,
        registry: &'a Registry,
        fetcher: &'a dyn ArtifactFetcher,
    ) -> Self {
        Self {
            cache,
            registry,
            fetcher,
        }
    }
}

#[async_trait::async_trait]
impl DescriptorSource for RegistryDescriptors<'_> {
    async fn descriptor(&self, key: &PluginKey) -> Result<PluginDescriptor> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.descriptor.clone());
        }
        let url = self
            .registry
            .descriptor_url(key)
            .map_err(|e| PluginError::DescriptorUnavailable {
                key: key.clone(),
                source: FetchError::InvalidUrl {
                    url: self.registry.internal_uri.to_string(),
                    source: e,
                },
            })?;
        debug!(key = %key, url = %url, "fetching descriptor missing from cache");
        let bytes =
            self.fetcher
                .fetch(&url)
                .await
                .map_err(|e| PluginError::DescriptorUnavailable {
                    key: key.clone(),
                    source: e,
                })?;
        PluginDescriptor::parse(&bytes, url.as_str())
    }
}

#[async_trait::async_trait]
impl DescriptorSource for HashMap<PluginKey, PluginDescriptor> {
    async fn descriptor(&self, key: &PluginKey) -> Result<PluginDescriptor> {
        self.get(key)
            .cloned()
            .ok_or_else(|| PluginError::DescriptorUnavailable {
                key: key.clone(),
                source: FetchError::NotFound {
                    url: key.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use tokio_stream::StreamExt;

    const BASE: &str = "https://registry.example.com/v3/plugins";

    fn meta(publisher: &str, name: &str) -> String {
        format!("metadata:\n  publisher: {publisher}\n  name: {name}\n  icon: /icons/{name}.png\n")
    }

    fn registries() -> Registries {
        Registries::new(
            Registry::new(
                "default",
                Url::parse("https://registry.example.com/v3").unwrap(),
            )
            .with_public_uri(Url::parse("https://public.example.com/v3").unwrap()),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CacheEvent>) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_build_cache_with_default_and_explicit_links() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert(
            format!("{BASE}/index.json"),
            r#"[{"id":"redhat/java/latest"},{"id":"ms/go/latest","links":{"self":"/v3/custom/go.yaml"}}]"#,
        );
        fetcher.insert(format!("{BASE}/redhat/java/latest/meta.yaml"), meta("redhat", "java"));
        fetcher.insert("https://registry.example.com/v3/custom/go.yaml", meta("ms", "go"));

        let builder = CacheBuilder::new(Arc::new(fetcher));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = builder
            .build(&registries(), &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        let java = cache.get(&PluginKey::latest("redhat", "java")).unwrap();
        assert_eq!(java.registry, "default");
        assert_eq!(
            java.icon_url.as_ref().map(Url::as_str),
            Some("https://public.example.com/v3/icons/java.png")
        );
        assert_eq!(
            drain(&mut rx),
            vec![
                CacheEvent::CacheSizeChanged(2),
                CacheEvent::PluginCached(1),
                CacheEvent::PluginCached(2),
                CacheEvent::CachingComplete,
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_registry_and_plugin_are_not_fatal() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert(
            format!("{BASE}/index.json"),
            r#"[{"id":"a/good/latest"},{"id":"a/broken/latest"},{"id":"a/missing/latest"}]"#,
        );
        fetcher.insert(format!("{BASE}/a/good/latest/meta.yaml"), meta("a", "good"));
        fetcher.insert(format!("{BASE}/a/broken/latest/meta.yaml"), "- not a descriptor");
        fetcher.insert("https://other.example.com/plugins/index.json", r#"{"not":"a list"}"#);

        let mut registries = registries();
        let other = Registry::new("other", Url::parse("https://other.example.com").unwrap());
        registries.insert(other.clone());

        let builder = CacheBuilder::new(Arc::new(fetcher));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cache = builder
            .build(&registries, &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&PluginKey::latest("a", "good")));
        let events = drain(&mut rx);
        assert!(events.contains(&CacheEvent::InvalidRegistryFound(other)));
        assert!(events.contains(&CacheEvent::InvalidPluginFound(
            Url::parse(&format!("{BASE}/a/broken/latest/meta.yaml")).unwrap()
        )));
        assert!(events.contains(&CacheEvent::InvalidPluginFound(
            Url::parse(&format!("{BASE}/a/missing/latest/meta.yaml")).unwrap()
        )));
        assert_eq!(events.last(), Some(&CacheEvent::CachingComplete));
    }

    #[tokio::test]
    async fn test_cancelled_build_does_not_complete() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert(format!("{BASE}/index.json"), r#"[{"id":"a/b/latest"}]"#);
        let builder = CacheBuilder::new(Arc::new(fetcher));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut update = builder.spawn(registries(), cancel);
        let events: Vec<CacheEvent> = (&mut update.events).collect().await;
        assert!(!events.contains(&CacheEvent::CachingComplete));
        assert!(matches!(update.finish().await, Err(PluginError::Cancelled)));
    }

    fn update_running(
        task: impl std::future::Future<Output = Result<PluginCache>> + Send + 'static,
    ) -> CacheUpdate {
        let (_tx, rx) = mpsc::unbounded_channel();
        CacheUpdate {
            events: UnboundedReceiverStream::new(rx),
            handle: tokio::spawn(task),
        }
    }

    #[tokio::test]
    #[should_panic(expected = "index walk crashed")]
    async fn test_panicking_build_propagates_panic() {
        let update = update_running(async {
            if true {
                panic!("index walk crashed");
            }
            Ok(PluginCache::default())
        });
        let _ = update.finish().await;
    }

    #[tokio::test]
    async fn test_aborted_build_is_cancelled() {
        let update = update_running(std::future::pending());
        update.handle.abort();
        assert!(matches!(update.finish().await, Err(PluginError::Cancelled)));
    }

    #[tokio::test]
    async fn test_registry_descriptors_fall_back_to_direct_fetch() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert(format!("{BASE}/a/unlisted/latest/meta.yaml"), meta("a", "unlisted"));
        let cache = PluginCache::default();
        let registries = registries();
        let source = RegistryDescriptors::new(&cache, registries.default_registry(), &fetcher);

        let descriptor = source
            .descriptor(&PluginKey::latest("a", "unlisted"))
            .await
            .unwrap();
        assert_eq!(descriptor.metadata.name, "unlisted");
        assert!(matches!(
            source.descriptor(&PluginKey::latest("a", "gone")).await,
            Err(PluginError::DescriptorUnavailable { .. })
        ));
    }
}
