//! Removal conflict checking.
//!
//! Before a plugin is staged for removal, every other installed or pending
//! plugin is checked for a dependency on it. Dependents still listed in a
//! registry block the removal. Dependents no longer listed anywhere are
//! orphans and are removed along with the target, after being checked the
//! same way themselves.

use std::collections::VecDeque;

use tracing::{debug, instrument};

use crate::{
    cache::{DescriptorSource, PluginCache},
    error::{PluginError, Result},
    key::PluginKey,
    ledger::Ledger,
};

/// Ledger changes a removal request turns into. Nothing is applied until the
/// whole plan was computed, so a blocked removal never mutates the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalPlan {
    /// Installed plugins to stage for removal, target first
    pub stage_removal: Vec<PluginKey>,
    /// Pending installs to drop, nothing of them was persisted yet
    pub unstage_install: Vec<PluginKey>,
}

impl RemovalPlan {
    pub fn is_empty(&self) -> bool {
        self.stage_removal.is_empty() && self.unstage_install.is_empty()
    }

    fn contains(&self, key: &PluginKey) -> bool {
        self.stage_removal.contains(key) || self.unstage_install.contains(key)
    }

    pub fn apply(&self, ledger: &mut Ledger) {
        for key in &self.unstage_install {
            ledger.unstage_install(key);
        }
        for key in &self.stage_removal {
            ledger.stage_removal(key);
        }
    }
}

pub struct ConflictChecker<'a> {
    source: &'a dyn DescriptorSource,
    cache: &'a PluginCache,
}

impl<'a> ConflictChecker<'a> {
    /// `cache` decides which dependents are still active
    pub fn new(source: &'a dyn DescriptorSource, cache: &'a PluginCache) -> Self {
        Self { source, cache }
    }

    /// Plan the removal of `key`.
    ///
    /// Keys already pending removal, or neither installed nor pending
    /// installation, produce an empty plan. An orphan that is itself blocked
    /// by an active dependent blocks the whole request, and the error names
    /// the requested key together with those blockers.
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn plan_removal(&self, key: &PluginKey, ledger: &Ledger) -> Result<RemovalPlan> {
        let mut plan = RemovalPlan::default();
        if ledger.is_pending_removal(key)
            || !(ledger.is_installed(key) || ledger.is_pending_install(key))
        {
            debug!("nothing to remove");
            return Ok(plan);
        }

        let mut queue = VecDeque::from([key.clone()]);
        while let Some(target) = queue.pop_front() {
            let dependents = self.dependents(&target, ledger, &plan).await?;
            let (active, orphaned): (Vec<PluginKey>, Vec<PluginKey>) = dependents
                .into_iter()
                .partition(|dependent| self.cache.contains(dependent));
            if !active.is_empty() {
                debug!(target = %target, blockers = active.len(), "removal blocked by active dependents");
                return Err(PluginError::RemovalBlocked {
                    key: key.clone(),
                    dependents: active,
                });
            }

            if ledger.is_pending_install(&target) {
                plan.unstage_install.push(target);
            } else {
                plan.stage_removal.push(target);
            }
            for orphan in orphaned {
                if !queue.contains(&orphan) && !plan.contains(&orphan) {
                    debug!(orphan = %orphan, "cascading removal to orphaned dependent");
                    queue.push_back(orphan);
                }
            }
        }
        Ok(plan)
    }

    /// Installed or pending plugins, other than `target` and those already
    /// planned for removal, that declare a dependency on `target`
    async fn dependents(
        &self,
        target: &PluginKey,
        ledger: &Ledger,
        plan: &RemovalPlan,
    ) -> Result<Vec<PluginKey>> {
        let mut dependents = Vec::new();
        for candidate in ledger.active() {
            if candidate == target || plan.contains(candidate) {
                continue;
            }
            let descriptor = self.source.descriptor(candidate).await?;
            if descriptor.dependencies.contains(target) {
                dependents.push(candidate.clone());
            }
        }
        Ok(dependents)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        cache::CachedPlugin,
        descriptor::{Metadata, PluginDescriptor},
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

    fn source(entries: &[(&str, &[&str])]) -> HashMap<PluginKey, PluginDescriptor> {
        entries
            .iter()
            .map(|(k, deps)| (key(k), descriptor(k, deps)))
            .collect()
    }

    fn cache_of(source: &HashMap<PluginKey, PluginDescriptor>, listed: &[&str]) -> PluginCache {
        listed
            .iter()
            .map(|k| CachedPlugin {
                registry: "default".to_string(),
                descriptor_url: Url::parse("https://r.example.com/meta.yaml").unwrap(),
                icon_url: None,
                descriptor: source[&key(k)].clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_active_dependent_blocks_removal() {
        let source = source(&[("p/lib", &[]), ("p/app", &["p/lib"])]);
        let cache = cache_of(&source, &["p/lib", "p/app"]);
        let ledger = Ledger::new([key("p/lib"), key("p/app")]);

        let err = ConflictChecker::new(&source, &cache)
            .plan_removal(&key("p/lib"), &ledger)
            .await
            .unwrap_err();
        match err {
            PluginError::RemovalBlocked { key: k, dependents } => {
                assert_eq!(k, key("p/lib"));
                assert_eq!(dependents, vec![key("p/app")]);
            }
            other => panic!("expected removal to be blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_orphaned_dependent_is_removed_too() {
        let source = source(&[("p/lib", &[]), ("p/old", &["p/lib"]), ("p/other", &[])]);
        let cache = cache_of(&source, &["p/lib", "p/other"]);
        let ledger = Ledger::new([key("p/lib"), key("p/old"), key("p/other")]);

        let plan = ConflictChecker::new(&source, &cache)
            .plan_removal(&key("p/lib"), &ledger)
            .await
            .unwrap();
        assert_eq!(plan.stage_removal, vec![key("p/lib"), key("p/old")]);
        assert!(plan.unstage_install.is_empty());
    }

    #[tokio::test]
    async fn test_orphan_with_active_dependent_blocks_everything() {
        let source = source(&[
            ("p/lib", &[]),
            ("p/old", &["p/lib"]),
            ("p/app", &["p/old"]),
        ]);
        let cache = cache_of(&source, &["p/lib", "p/app"]);
        let ledger = Ledger::new([key("p/lib"), key("p/old"), key("p/app")]);

        let err = ConflictChecker::new(&source, &cache)
            .plan_removal(&key("p/lib"), &ledger)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::RemovalBlocked { key: k, dependents } if k == key("p/lib") && dependents == vec![key("p/app")]
        ));
    }

    #[tokio::test]
    async fn test_pending_install_without_dependents_is_unstaged() {
        let source = source(&[("p/new", &[])]);
        let cache = cache_of(&source, &["p/new"]);
        let mut ledger = Ledger::default();
        ledger.stage_install(&[key("p/new")]);

        let plan = ConflictChecker::new(&source, &cache)
            .plan_removal(&key("p/new"), &ledger)
            .await
            .unwrap();
        assert_eq!(plan.unstage_install, vec![key("p/new")]);
        assert!(plan.stage_removal.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_or_pending_removal_is_noop() {
        let source = source(&[("p/a", &[])]);
        let cache = cache_of(&source, &["p/a"]);
        let mut ledger = Ledger::new([key("p/a")]);
        ledger.stage_removal(&key("p/a"));
        let checker = ConflictChecker::new(&source, &cache);

        assert!(checker.plan_removal(&key("p/a"), &ledger).await.unwrap().is_empty());
        assert!(checker.plan_removal(&key("p/zzz"), &ledger).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dependents_staged_for_removal_do_not_block() {
        let source = source(&[("p/lib", &[]), ("p/app", &["p/lib"])]);
        let cache = cache_of(&source, &["p/lib", "p/app"]);
        let mut ledger = Ledger::new([key("p/lib"), key("p/app")]);
        ledger.stage_removal(&key("p/app"));

        let plan = ConflictChecker::new(&source, &cache)
            .plan_removal(&key("p/lib"), &ledger)
            .await
            .unwrap();
        assert_eq!(plan.stage_removal, vec![key("p/lib")]);
    }
}
