//! Install and remove requests against a [`Ledger`].
//!
//! Both operations compute their full effect first and only then touch the
//! ledger, so a failed request leaves it exactly as it was.

use tracing::{debug, info, instrument};

use crate::{
    cache::{DescriptorSource, PluginCache},
    client::PluginClient,
    conflict::{ConflictChecker, RemovalPlan},
    error::{PluginError, Result},
    fetch::ArtifactFetcher,
    key::PluginKey,
    ledger::Ledger,
    resolver::Resolver,
};

/// Collaborators an install or remove request needs
#[derive(Clone, Copy)]
pub struct TransactionContext<'a> {
    pub source: &'a dyn DescriptorSource,
    pub cache: &'a PluginCache,
    pub fetcher: &'a dyn ArtifactFetcher,
    pub client: &'a dyn PluginClient,
    /// Check that every extension URL is reachable before staging an install
    pub verify_artifacts: bool,
}

/// What an install request changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Keys newly staged for installation, in resolution order
    pub staged: Vec<PluginKey>,
    /// Keys whose pending removal was cancelled instead
    pub restored: Vec<PluginKey>,
}

impl InstallOutcome {
    pub fn is_noop(&self) -> bool {
        self.staged.is_empty() && self.restored.is_empty()
    }
}

/// Stage `key` and its missing dependencies for installation.
///
/// Cancels a pending removal of `key` without resolving anything, and does
/// nothing for installed or pending plugins. Dependencies still listed in the
/// cache need confirmation from the client; unlisted ones are staged without
/// asking.
#[instrument(level = "debug", skip_all, fields(key = %key))]
pub async fn install(
    ledger: &mut Ledger,
    key: &PluginKey,
    ctx: &TransactionContext<'_>,
) -> Result<InstallOutcome> {
    if ledger.cancel_removal(key) {
        info!(key = %key, "cancelled pending removal");
        return Ok(InstallOutcome {
            staged: Vec::new(),
            restored: vec![key.clone()],
        });
    }
    if ledger.is_installed(key) {
        debug!("plugin already installed");
        return Ok(InstallOutcome::default());
    }

    let mut resolver = Resolver::new(ctx.source);
    if ctx.verify_artifacts {
        resolver = resolver.verify_artifacts(ctx.fetcher);
    }
    let resolved = resolver.resolve(key, ledger).await?;

    let confirm: Vec<PluginKey> = resolved
        .iter()
        .filter(|k| *k != key && !ledger.is_pending_removal(k) && ctx.cache.contains(k))
        .cloned()
        .collect();
    if !confirm.is_empty() && !ctx.client.ask_to_install_dependencies(&confirm).await {
        info!(key = %key, "dependency installation declined");
        return Err(PluginError::DependenciesDeclined {
            dependencies: confirm,
        });
    }

    let (restored, staged): (Vec<PluginKey>, Vec<PluginKey>) = resolved
        .into_iter()
        .partition(|k| ledger.is_pending_removal(k));
    ledger.stage_install(restored.iter().chain(staged.iter()));
    info!(key = %key, staged = staged.len(), "plugin staged for installation");
    Ok(InstallOutcome { staged, restored })
}

/// Stage `key` for removal, cascading to orphaned dependents.
///
/// Returns the plan that was applied; an empty plan means there was nothing
/// to remove.
#[instrument(level = "debug", skip_all, fields(key = %key))]
pub async fn remove(
    ledger: &mut Ledger,
    key: &PluginKey,
    ctx: &TransactionContext<'_>,
) -> Result<RemovalPlan> {
    let plan = ConflictChecker::new(ctx.source, ctx.cache)
        .plan_removal(key, ledger)
        .await?;
    plan.apply(ledger);
    if !plan.is_empty() {
        info!(
            key = %key,
            removals = plan.stage_removal.len(),
            unstaged = plan.unstage_install.len(),
            "plugin staged for removal"
        );
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        cache::CachedPlugin,
        client::RecordingClient,
        descriptor::{Metadata, PluginDescriptor},
        fetch::MemoryFetcher,
    };
    use url::Url;

    fn key(s: &str) -> PluginKey {
        s.parse().unwrap()
    }

    fn descriptor(k: &str, deps: &[&str]) -> PluginDescriptor {
        let key = key(k);
        PluginDescriptor {
            metadata: Metadata {
                publisher: key.publisher().to_string(),
                name: key.name().to_string(),
                version: key.version().to_string(),
                ..Default::default()
            },
            dependencies: deps.iter().map(|d| d.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    struct Fixture {
        source: HashMap<PluginKey, PluginDescriptor>,
        cache: PluginCache,
        fetcher: MemoryFetcher,
        client: RecordingClient,
    }

    impl Fixture {
        fn new(entries: &[(&str, &[&str])], listed: &[&str], accept: bool) -> Self {
            let source: HashMap<PluginKey, PluginDescriptor> = entries
                .iter()
                .map(|(k, deps)| (key(k), descriptor(k, deps)))
                .collect();
            let cache = listed
                .iter()
                .map(|k| CachedPlugin {
                    registry: "default".to_string(),
                    descriptor_url: Url::parse("https://r.example.com/meta.yaml").unwrap(),
                    icon_url: None,
                    descriptor: source[&key(k)].clone(),
                })
                .collect();
            Self {
                source,
                cache,
                fetcher: MemoryFetcher::new(),
                client: RecordingClient::new(accept),
            }
        }

        fn ctx(&self) -> TransactionContext<'_> {
            TransactionContext {
                source: &self.source,
                cache: &self.cache,
                fetcher: &self.fetcher,
                client: &self.client,
                verify_artifacts: true,
            }
        }
    }

    #[tokio::test]
    async fn test_install_already_installed_is_noop() {
        let fixture = Fixture::new(&[("p/a", &[])], &["p/a"], true);
        let mut ledger = Ledger::new([key("p/a")]);
        let before = ledger.clone();

        let outcome = install(&mut ledger, &key("p/a"), &fixture.ctx()).await.unwrap();
        assert!(outcome.is_noop());
        assert_eq!(ledger, before);
        assert_eq!(fixture.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_install_cancels_pending_removal() {
        let fixture = Fixture::new(&[("p/a", &[])], &["p/a"], true);
        let mut ledger = Ledger::new([key("p/a")]);
        ledger.stage_removal(&key("p/a"));

        let outcome = install(&mut ledger, &key("p/a"), &fixture.ctx()).await.unwrap();
        assert_eq!(outcome.restored, vec![key("p/a")]);
        assert!(ledger.is_installed(&key("p/a")));
        assert!(!ledger.has_staged_changes());
    }

    #[tokio::test]
    async fn test_install_asks_only_about_listed_dependencies() {
        let fixture = Fixture::new(
            &[("p/app", &["p/listed", "p/stale"]), ("p/listed", &[]), ("p/stale", &[])],
            &["p/app", "p/listed"],
            true,
        );
        let mut ledger = Ledger::default();

        let outcome = install(&mut ledger, &key("p/app"), &fixture.ctx()).await.unwrap();
        assert_eq!(outcome.staged, vec![key("p/app"), key("p/listed"), key("p/stale")]);
        assert_eq!(ledger.to_install(), outcome.staged.as_slice());
        assert_eq!(fixture.client.questions(), vec![vec![key("p/listed")]]);
    }

    #[tokio::test]
    async fn test_declined_dependencies_leave_ledger_untouched() {
        let fixture = Fixture::new(&[("p/app", &["p/lib"]), ("p/lib", &[])], &["p/app", "p/lib"], false);
        let mut ledger = Ledger::default();

        let err = install(&mut ledger, &key("p/app"), &fixture.ctx()).await.unwrap_err();
        assert!(matches!(err, PluginError::DependenciesDeclined { ref dependencies } if dependencies == &vec![key("p/lib")]));
        assert_eq!(ledger, Ledger::default());
    }

    #[tokio::test]
    async fn test_install_restores_dependency_pending_removal() {
        let fixture = Fixture::new(&[("p/app", &["p/lib"]), ("p/lib", &[])], &["p/app", "p/lib"], true);
        let mut ledger = Ledger::new([key("p/lib")]);
        ledger.stage_removal(&key("p/lib"));

        let outcome = install(&mut ledger, &key("p/app"), &fixture.ctx()).await.unwrap();
        assert_eq!(outcome.staged, vec![key("p/app")]);
        assert_eq!(outcome.restored, vec![key("p/lib")]);
        assert!(fixture.client.questions().is_empty());
        assert!(ledger.is_installed(&key("p/lib")));
        assert_eq!(ledger.to_install(), &[key("p/app")]);
    }

    #[tokio::test]
    async fn test_remove_pending_install_only_touches_to_install() {
        let fixture = Fixture::new(&[("p/a", &[]), ("p/b", &[])], &["p/a", "p/b"], true);
        let mut ledger = Ledger::new([key("p/b")]);
        ledger.stage_install(&[key("p/a")]);

        let plan = remove(&mut ledger, &key("p/a"), &fixture.ctx()).await.unwrap();
        assert_eq!(plan.unstage_install, vec![key("p/a")]);
        assert!(ledger.to_install().is_empty());
        assert_eq!(ledger.installed(), &[key("p/b")]);
        assert!(ledger.to_remove().is_empty());
    }
}
