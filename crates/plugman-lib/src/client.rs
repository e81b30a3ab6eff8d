use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::{cache::CacheEvent, key::PluginKey};

/// One-way notification channel to whoever drives the session, plus the
/// single question the service ever asks: whether to pull in dependencies.
#[async_trait::async_trait]
pub trait PluginClient: Send + Sync + 'static {
    /// Called for every cache pass event, in order
    async fn notify(&self, event: CacheEvent);

    /// Ask whether the listed dependencies may be installed alongside the
    /// requested plugin. Returning `false` aborts the install.
    async fn ask_to_install_dependencies(&self, dependencies: &[PluginKey]) -> bool;
}

/// Client that logs every event and answers dependency questions with a
/// fixed reply
#[derive(Debug, Clone, Copy)]
pub struct LoggingClient {
    accept_dependencies: bool,
}

impl LoggingClient {
    pub fn new(accept_dependencies: bool) -> Self {
        Self {
            accept_dependencies,
        }
    }
}

#[async_trait::async_trait]
impl PluginClient for LoggingClient {
    async fn notify(&self, event: CacheEvent) {
        match event {
            CacheEvent::CacheSizeChanged(count) => debug!(count, "plugin cache size changed"),
            CacheEvent::PluginCached(count) => debug!(count, "plugin cached"),
            CacheEvent::CachingComplete => info!("plugin caching complete"),
            CacheEvent::InvalidRegistryFound(registry) => {
                warn!(registry = %registry.name, "invalid registry found")
            }
            CacheEvent::InvalidPluginFound(url) => warn!(url = %url, "invalid plugin found"),
        }
    }

    async fn ask_to_install_dependencies(&self, dependencies: &[PluginKey]) -> bool {
        debug!(
            count = dependencies.len(),
            accepted = self.accept_dependencies,
            "answering dependency confirmation"
        );
        self.accept_dependencies
    }
}

/// Client that records everything it is told, for assertions
#[derive(Debug, Clone)]
pub struct RecordingClient {
    accept_dependencies: bool,
    events: Arc<Mutex<Vec<CacheEvent>>>,
    questions: Arc<Mutex<Vec<Vec<PluginKey>>>>,
}

impl RecordingClient {
    pub fn new(accept_dependencies: bool) -> Self {
        Self {
            accept_dependencies,
            events: Arc::default(),
            questions: Arc::default(),
        }
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Every dependency list the client was asked about
    pub fn questions(&self) -> Vec<Vec<PluginKey>> {
        self.questions.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl PluginClient for RecordingClient {
    async fn notify(&self, event: CacheEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    async fn ask_to_install_dependencies(&self, dependencies: &[PluginKey]) -> bool {
        if let Ok(mut questions) = self.questions.lock() {
            questions.push(dependencies.to_vec());
        }
        self.accept_dependencies
    }
}
