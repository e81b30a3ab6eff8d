//! Staged install/removal state of one session.
//!
//! A [`Ledger`] tracks three disjoint ordered sets of plugin keys:
//!
//! - `installed`: active in the running workspace and not staged for removal
//! - `to_install`: staged for installation, not committed yet
//! - `to_remove`: installed plugins staged for removal, not committed yet
//!
//! Every transition below keeps a key in at most one set. A plugin staged for
//! removal is still physically installed until the next commit, which is why
//! cancelling its removal moves it straight back to `installed`.

use serde::Serialize;

use crate::key::PluginKey;

/// Where a plugin stands in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Installed,
    PendingInstall,
    PendingRemoval,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ledger {
    installed: Vec<PluginKey>,
    to_install: Vec<PluginKey>,
    to_remove: Vec<PluginKey>,
}

impl Ledger {
    /// Start a session from the plugins currently active in the workspace
    pub fn new(installed: impl IntoIterator<Item = PluginKey>) -> Self {
        let mut ledger = Self::default();
        for key in installed {
            if !ledger.installed.contains(&key) {
                ledger.installed.push(key);
            }
        }
        ledger
    }

    pub fn installed(&self) -> &[PluginKey] {
        &self.installed
    }

    pub fn to_install(&self) -> &[PluginKey] {
        &self.to_install
    }

    pub fn to_remove(&self) -> &[PluginKey] {
        &self.to_remove
    }

    pub fn is_installed(&self, key: &PluginKey) -> bool {
        self.installed.contains(key)
    }

    pub fn is_pending_install(&self, key: &PluginKey) -> bool {
        self.to_install.contains(key)
    }

    pub fn is_pending_removal(&self, key: &PluginKey) -> bool {
        self.to_remove.contains(key)
    }

    pub fn state(&self, key: &PluginKey) -> Option<PluginState> {
        if self.is_installed(key) {
            Some(PluginState::Installed)
        } else if self.is_pending_install(key) {
            Some(PluginState::PendingInstall)
        } else if self.is_pending_removal(key) {
            Some(PluginState::PendingRemoval)
        } else {
            None
        }
    }

    pub fn has_staged_changes(&self) -> bool {
        !self.to_install.is_empty() || !self.to_remove.is_empty()
    }

    /// Installed and pending plugins, the set that may depend on a removal target
    pub fn active(&self) -> impl Iterator<Item = &PluginKey> {
        self.installed.iter().chain(self.to_install.iter())
    }

    /// The installed set as it will look once the staged changes are committed
    pub fn installed_after_commit(&self) -> Vec<PluginKey> {
        self.active().cloned().collect()
    }

    /// Stage keys for installation in order. Keys pending removal get their
    /// removal cancelled instead; keys already installed or pending are skipped.
    pub(crate) fn stage_install<'a>(&mut self, keys: impl IntoIterator<Item = &'a PluginKey>) {
        for key in keys {
            if self.cancel_removal(key) || self.is_installed(key) || self.is_pending_install(key)
            {
                continue;
            }
            self.to_install.push(key.clone());
        }
    }

    /// Move a key staged for removal back to `installed`
    pub(crate) fn cancel_removal(&mut self, key: &PluginKey) -> bool {
        match self.to_remove.iter().position(|k| k == key) {
            Some(index) => {
                let key = self.to_remove.remove(index);
                self.installed.push(key);
                true
            }
            None => false,
        }
    }

    /// Drop a key that was staged for installation
    pub(crate) fn unstage_install(&mut self, key: &PluginKey) -> bool {
        match self.to_install.iter().position(|k| k == key) {
            Some(index) => {
                self.to_install.remove(index);
                true
            }
            None => false,
        }
    }

    /// Move an installed key to `to_remove`
    pub(crate) fn stage_removal(&mut self, key: &PluginKey) -> bool {
        match self.installed.iter().position(|k| k == key) {
            Some(index) => {
                let key = self.installed.remove(index);
                self.to_remove.push(key);
                true
            }
            None => false,
        }
    }

    /// Apply the staged changes: pending installs become installed and
    /// pending removals are forgotten.
    pub(crate) fn commit(&mut self) {
        self.installed.append(&mut self.to_install);
        self.to_remove.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PluginKey {
        s.parse().unwrap()
    }

    fn assert_disjoint(ledger: &Ledger) {
        for k in ledger.installed() {
            assert!(!ledger.is_pending_install(k) && !ledger.is_pending_removal(k));
        }
        for k in ledger.to_install() {
            assert!(!ledger.is_pending_removal(k));
        }
    }

    #[test]
    fn test_new_deduplicates() {
        let ledger = Ledger::new([key("a/a"), key("b/b"), key("a/a")]);
        assert_eq!(ledger.installed(), &[key("a/a"), key("b/b")]);
        assert!(!ledger.has_staged_changes());
    }

    #[test]
    fn test_stage_install_skips_known_keys() {
        let mut ledger = Ledger::new([key("a/a")]);
        ledger.stage_install(&[key("b/b"), key("a/a"), key("c/c"), key("b/b")]);
        assert_eq!(ledger.to_install(), &[key("b/b"), key("c/c")]);
        assert_eq!(ledger.state(&key("c/c")), Some(PluginState::PendingInstall));
        assert_disjoint(&ledger);
    }

    #[test]
    fn test_removal_and_cancellation() {
        let mut ledger = Ledger::new([key("a/a"), key("b/b")]);
        assert!(ledger.stage_removal(&key("a/a")));
        assert_eq!(ledger.state(&key("a/a")), Some(PluginState::PendingRemoval));
        assert_disjoint(&ledger);

        ledger.stage_install(&[key("a/a")]);
        assert!(ledger.to_remove().is_empty());
        assert!(ledger.to_install().is_empty());
        assert_eq!(ledger.state(&key("a/a")), Some(PluginState::Installed));
        assert_disjoint(&ledger);
    }

    #[test]
    fn test_commit_drains_staged_sets() {
        let mut ledger = Ledger::new([key("a/a"), key("b/b")]);
        ledger.stage_removal(&key("b/b"));
        ledger.stage_install(&[key("c/c")]);
        assert_eq!(ledger.installed_after_commit(), vec![key("a/a"), key("c/c")]);

        ledger.commit();
        assert_eq!(ledger.installed(), &[key("a/a"), key("c/c")]);
        assert!(!ledger.has_staged_changes());
        assert_eq!(ledger.state(&key("b/b")), None);
    }

    #[test]
    fn test_unstage_install() {
        let mut ledger = Ledger::default();
        ledger.stage_install(&[key("a/a")]);
        assert!(ledger.unstage_install(&key("a/a")));
        assert!(!ledger.unstage_install(&key("a/a")));
        assert!(!ledger.has_staged_changes());
    }
}
