use std::path::PathBuf;

use crate::key::PluginKey;

pub type Result<T, E = PluginError> = std::result::Result<T, E>;

/// Failures reported by an [`crate::fetch::ArtifactFetcher`]
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{url} was not found")]
    NotFound { url: String },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported url scheme for {url}")]
    UnsupportedScheme { url: String },
    #[error("invalid url {url}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Every failure a plugin service operation can surface.
///
/// The variants group into the categories callers care about: resolution
/// failures leave the ledger untouched, a blocked removal names its blockers,
/// and commit failures roll back whatever the failed commit wrote.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("invalid plugin key '{0}', expected publisher/name[/version]")]
    InvalidKey(String),

    /// The descriptor of a plugin could not be retrieved
    #[error("failed to fetch descriptor of plugin '{key}'")]
    DescriptorUnavailable {
        key: PluginKey,
        #[source]
        source: FetchError,
    },

    #[error("descriptor at {url} is not a valid plugin descriptor")]
    InvalidDescriptor {
        url: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("extension {url} of plugin '{key}' is not reachable")]
    UnreachableArtifact { key: PluginKey, url: String },

    #[error("dependency cycle detected: {}", join_keys(path, " -> "))]
    DependencyCycle { path: Vec<PluginKey> },

    #[error("installation of dependencies {} was declined", join_keys(dependencies, ", "))]
    DependenciesDeclined { dependencies: Vec<PluginKey> },

    /// Removal rejected because plugins still listed in a registry depend on the target
    #[error("{}", removal_blocked_message(key, dependents))]
    RemovalBlocked {
        key: PluginKey,
        dependents: Vec<PluginKey>,
    },

    #[error("failed to download {url} for plugin '{key}'")]
    Download {
        key: PluginKey,
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("artifact storage failed at {}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no component in the workspace qualifies as the dev container")]
    NoDevContainer,

    #[error("components {} are all annotated as the dev container", names.join(", "))]
    AmbiguousDevContainer { names: Vec<String> },

    #[error("failed to update workspace components")]
    Workspace(#[source] anyhow::Error),

    #[error("failed to write installed plugin manifest {}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown registry '{0}'")]
    UnknownRegistry(String),

    #[error("the default registry '{0}' cannot be removed")]
    DefaultRegistry(String),

    #[error("registry cache update was superseded by a newer update")]
    Cancelled,
}

fn join_keys(keys: &[PluginKey], separator: &str) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

fn removal_blocked_message(key: &PluginKey, dependents: &[PluginKey]) -> String {
    match dependents {
        [single] => format!("cannot remove plugin '{key}': plugin '{single}' depends on it"),
        many => format!(
            "cannot remove plugin '{key}': plugins {} depend on it",
            many.iter()
                .map(|k| format!("'{k}'"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}
