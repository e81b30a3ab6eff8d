use tracing::{debug, instrument, trace};
use url::Url;

use crate::{
    cache::DescriptorSource,
    error::{PluginError, Result},
    fetch::ArtifactFetcher,
    key::PluginKey,
    ledger::Ledger,
};

/// Expands a plugin into the ordered set of keys that must be staged to
/// install it.
///
/// The traversal is depth-first in declaration order, so the requested plugin
/// comes first and every dependency follows its first dependent. Plugins
/// already installed or pending installation are not expanded, and a plugin
/// reachable over several paths is visited once. A dependency that leads back
/// onto the current path is rejected as a cycle.
pub struct Resolver<'a> {
    source: &'a dyn DescriptorSource,
    verifier: Option<&'a dyn ArtifactFetcher>,
}

impl<'a> Resolver<'a> {
    pub fn new(source: &'a dyn DescriptorSource) -> Self {
        Self {
            source,
            verifier: None,
        }
    }

    /// Check that every extension URL of every resolved plugin is reachable
    pub fn verify_artifacts(self, fetcher: &'a dyn ArtifactFetcher) -> Self {
        Self {
            verifier: Some(fetcher),
            ..self
        }
    }

    /// Resolve `root` against `ledger`. Any failure aborts the whole
    /// resolution; no partial set is ever returned.
    #[instrument(level = "debug", skip_all, fields(root = %root))]
    pub async fn resolve(&self, root: &PluginKey, ledger: &Ledger) -> Result<Vec<PluginKey>> {
        let mut resolved: Vec<PluginKey> = Vec::new();
        if is_settled(root, ledger) {
            trace!("plugin already installed or staged");
            return Ok(resolved);
        }

        // Current DFS path, each entry with its not-yet-visited dependencies
        let mut path: Vec<(PluginKey, std::vec::IntoIter<PluginKey>)> = Vec::new();
        let dependencies = self.expand(root, &mut resolved).await?;
        path.push((root.clone(), dependencies.into_iter()));

        while let Some((_, pending)) = path.last_mut() {
            let Some(dependency) = pending.next() else {
                path.pop();
                continue;
            };
            if let Some(start) = path.iter().position(|(key, _)| key == &dependency) {
                let mut cycle: Vec<PluginKey> =
                    path[start..].iter().map(|(key, _)| key.clone()).collect();
                cycle.push(dependency);
                return Err(PluginError::DependencyCycle { path: cycle });
            }
            if is_settled(&dependency, ledger) || resolved.contains(&dependency) {
                continue;
            }
            let dependencies = self.expand(&dependency, &mut resolved).await?;
            path.push((dependency, dependencies.into_iter()));
        }

        debug!(count = resolved.len(), "resolved plugin set");
        Ok(resolved)
    }

    /// Fetch the descriptor of `key`, record it as resolved, verify its
    /// artifacts and hand back its dependencies
    async fn expand(&self, key: &PluginKey, resolved: &mut Vec<PluginKey>) -> Result<Vec<PluginKey>> {
        let descriptor = self.source.descriptor(key).await?;
        resolved.push(key.clone());

        if let Some(fetcher) = self.verifier {
            for extension in &descriptor.extensions {
                let reachable = match Url::parse(extension) {
                    Ok(url) => fetcher.exists(&url).await,
                    Err(_) => false,
                };
                if !reachable {
                    return Err(PluginError::UnreachableArtifact {
                        key: key.clone(),
                        url: extension.clone(),
                    });
                }
            }
        }
        Ok(descriptor.dependencies)
    }
}

fn is_settled(key: &PluginKey, ledger: &Ledger) -> bool {
    ledger.is_installed(key) || ledger.is_pending_install(key)
}
