//! Retrieval of registry indexes, descriptors and extension artifacts.
//!
//! Everything that goes over the network passes through [`ArtifactFetcher`],
//! so the cache builder, resolver and commit engine never deal with HTTP
//! directly. [`HttpFetcher`] is the production implementation and also
//! understands `file://` URLs; [`MemoryFetcher`] serves canned responses.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{debug, trace};
use url::Url;

use crate::error::FetchError;

/// Opaque retrieval collaborator. Timeouts and retries are the
/// implementation's own business.
#[async_trait::async_trait]
pub trait ArtifactFetcher: Send + Sync + 'static {
    /// Retrieve the bytes behind `url`
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError>;

    /// Whether `url` is reachable without downloading it
    async fn exists(&self, url: &Url) -> bool;
}

/// Fetcher backed by `reqwest` for `http(s)` URLs and the local filesystem
/// for `file` URLs
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("plugman/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
        match url.scheme() {
            "http" | "https" => {
                debug!(url = %url, "fetching");
                let response = self.client.get(url.clone()).send().await.map_err(|e| {
                    FetchError::Http {
                        url: url.to_string(),
                        source: e,
                    }
                })?;
                match response.status() {
                    StatusCode::NOT_FOUND => Err(FetchError::NotFound {
                        url: url.to_string(),
                    }),
                    status if !status.is_success() => Err(FetchError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    }),
                    _ => response.bytes().await.map_err(|e| FetchError::Http {
                        url: url.to_string(),
                        source: e,
                    }),
                }
            }
            "file" => {
                let path = url.to_file_path().map_err(|()| FetchError::UnsupportedScheme {
                    url: url.to_string(),
                })?;
                trace!(path = %path.display(), "reading local file");
                match tokio::fs::read(&path).await {
                    Ok(data) => Ok(Bytes::from(data)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Err(FetchError::NotFound {
                            url: url.to_string(),
                        })
                    }
                    Err(e) => Err(FetchError::Io { path, source: e }),
                }
            }
            _ => Err(FetchError::UnsupportedScheme {
                url: url.to_string(),
            }),
        }
    }

    async fn exists(&self, url: &Url) -> bool {
        match url.scheme() {
            "http" | "https" => match self.client.head(url.clone()).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    debug!(url = %url, error = %e, "existence check failed");
                    false
                }
            },
            "file" => match url.to_file_path() {
                Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                Err(()) => false,
            },
            _ => false,
        }
    }
}

/// In-memory fetcher serving registered responses.
///
/// Counts every call so callers can assert that an operation did not touch
/// the network at all.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    responses: Arc<RwLock<HashMap<String, Bytes>>>,
    calls: Arc<AtomicUsize>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body served for `url`
    pub fn insert(&self, url: impl AsRef<str>, body: impl Into<Bytes>) {
        if let Ok(mut responses) = self.responses.write() {
            responses.insert(url.as_ref().to_string(), body.into());
        }
    }

    /// Make `url` unreachable
    pub fn remove(&self, url: impl AsRef<str>) {
        if let Ok(mut responses) = self.responses.write() {
            responses.remove(url.as_ref());
        }
    }

    /// Number of `fetch` and `exists` calls served so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &Url) -> Option<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .read()
            .ok()
            .and_then(|responses| responses.get(url.as_str()).cloned())
    }
}

#[async_trait::async_trait]
impl ArtifactFetcher for MemoryFetcher {
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
        self.lookup(url).ok_or_else(|| FetchError::NotFound {
            url: url.to_string(),
        })
    }

    async fn exists(&self, url: &Url) -> bool {
        self.lookup(url).is_some()
    }
}
