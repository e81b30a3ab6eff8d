use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{descriptor::DESCRIPTOR_FILE_NAME, error::PluginError, key::PluginKey};

const PLUGINS_PATH: &str = "plugins/";
const INDEX_FILE_NAME: &str = "index.json";

/// A plugin registry.
///
/// `internal_uri` is used for every index and descriptor download, while
/// `public_uri` is only used to build links handed out to clients, such as
/// icon URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub name: String,
    pub internal_uri: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_uri: Option<Url>,
}

impl Registry {
    pub fn new(name: impl Into<String>, internal_uri: Url) -> Self {
        Self {
            name: name.into(),
            internal_uri,
            public_uri: None,
        }
    }

    pub fn with_public_uri(self, public_uri: Url) -> Self {
        Self {
            public_uri: Some(public_uri),
            ..self
        }
    }

    /// The public URI, falling back to the internal one
    pub fn public_uri(&self) -> &Url {
        self.public_uri.as_ref().unwrap_or(&self.internal_uri)
    }

    /// Base URL every descriptor link of this registry is resolved against
    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        directory(&self.internal_uri).join(PLUGINS_PATH)
    }

    pub fn index_url(&self) -> Result<Url, url::ParseError> {
        self.base_url()?.join(INDEX_FILE_NAME)
    }

    /// Default descriptor location: `{base}/{publisher}/{name}/{version}/meta.yaml`
    pub fn descriptor_url(&self, key: &PluginKey) -> Result<Url, url::ParseError> {
        self.base_url()?.join(&format!("{key}/{DESCRIPTOR_FILE_NAME}"))
    }

    /// Resolve a descriptor link from the index. Absolute URLs are used as-is,
    /// anything else is resolved against [`Registry::base_url`].
    pub fn resolve_link(&self, link: &str) -> Result<Url, url::ParseError> {
        match Url::parse(link) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => self.base_url()?.join(link),
            Err(e) => Err(e),
        }
    }

    /// Build an externally reachable link for a registry resource such as an icon
    pub fn public_link(&self, link: &str) -> Result<Url, url::ParseError> {
        match Url::parse(link) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                directory(self.public_uri()).join(link.trim_start_matches('/'))
            }
            Err(e) => Err(e),
        }
    }
}

fn directory(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// The named registries of a session, one of which is the default.
///
/// Plugins that are not found in the cache are fetched directly from the
/// default registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registries {
    registries: BTreeMap<String, Registry>,
    default: String,
}

impl Registries {
    pub fn new(default: Registry) -> Self {
        let name = default.name.clone();
        Self {
            registries: BTreeMap::from([(name.clone(), default)]),
            default: name,
        }
    }

    /// Build a registry set from a list, failing if `default` is not part of it
    pub fn from_list(
        registries: impl IntoIterator<Item = Registry>,
        default: &str,
    ) -> Result<Self, PluginError> {
        let registries: BTreeMap<String, Registry> = registries
            .into_iter()
            .map(|registry| (registry.name.clone(), registry))
            .collect();
        if !registries.contains_key(default) {
            return Err(PluginError::UnknownRegistry(default.to_string()));
        }
        Ok(Self {
            registries,
            default: default.to_string(),
        })
    }

    /// Add or replace a registry
    pub fn insert(&mut self, registry: Registry) {
        self.registries.insert(registry.name.clone(), registry);
    }

    pub fn remove(&mut self, name: &str) -> Result<Registry, PluginError> {
        if name == self.default {
            return Err(PluginError::DefaultRegistry(name.to_string()));
        }
        self.registries
            .remove(name)
            .ok_or_else(|| PluginError::UnknownRegistry(name.to_string()))
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), PluginError> {
        if !self.registries.contains_key(name) {
            return Err(PluginError::UnknownRegistry(name.to_string()));
        }
        self.default = name.to_string();
        Ok(())
    }

    pub fn default_registry(&self) -> &Registry {
        // `default` always names a registry in the map, see `remove`
        &self.registries[&self.default]
    }

    pub fn get(&self, name: &str) -> Option<&Registry> {
        self.registries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registry> {
        self.registries.values()
    }

    pub fn len(&self) -> usize {
        self.registries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(uri: &str) -> Registry {
        Registry::new("default", Url::parse(uri).unwrap())
    }

    #[test]
    fn test_registry_urls() {
        let registry = registry("https://plugins.example.com/v3");
        assert_eq!(
            registry.index_url().unwrap().as_str(),
            "https://plugins.example.com/v3/plugins/index.json"
        );
        assert_eq!(
            registry
                .descriptor_url(&PluginKey::latest("redhat", "java"))
                .unwrap()
                .as_str(),
            "https://plugins.example.com/v3/plugins/redhat/java/latest/meta.yaml"
        );
    }

    #[test]
    fn test_resolve_link() {
        let registry = registry("https://plugins.example.com/v3/");
        assert_eq!(
            registry.resolve_link("redhat/java/latest/meta.yaml").unwrap().as_str(),
            "https://plugins.example.com/v3/plugins/redhat/java/latest/meta.yaml"
        );
        assert_eq!(
            registry
                .resolve_link("/v3/plugins/redhat/java/latest/meta.yaml")
                .unwrap()
                .as_str(),
            "https://plugins.example.com/v3/plugins/redhat/java/latest/meta.yaml"
        );
        assert_eq!(
            registry.resolve_link("https://mirror.example.com/meta.yaml").unwrap().as_str(),
            "https://mirror.example.com/meta.yaml"
        );
    }

    #[test]
    fn test_public_link_uses_public_uri() {
        let registry = registry("http://registry.internal:8080/v3")
            .with_public_uri(Url::parse("https://registry.example.com/v3").unwrap());
        assert_eq!(
            registry.public_link("/images/java.png").unwrap().as_str(),
            "https://registry.example.com/v3/images/java.png"
        );
        assert_eq!(
            registry.index_url().unwrap().as_str(),
            "http://registry.internal:8080/v3/plugins/index.json"
        );
    }

    #[test]
    fn test_registries_default_cannot_be_removed() {
        let mut registries = Registries::new(registry("https://a.example.com"));
        registries.insert(Registry::new(
            "mirror",
            Url::parse("https://b.example.com").unwrap(),
        ));
        assert_eq!(registries.len(), 2);
        assert!(matches!(
            registries.remove("default"),
            Err(PluginError::DefaultRegistry(_))
        ));
        assert!(matches!(
            registries.remove("missing"),
            Err(PluginError::UnknownRegistry(_))
        ));
        registries.set_default("mirror").unwrap();
        assert!(registries.remove("default").is_ok());
        assert_eq!(registries.default_registry().name, "mirror");
    }

    #[test]
    fn test_from_list_requires_default() {
        let err = Registries::from_list(vec![registry("https://a.example.com")], "other")
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownRegistry(name) if name == "other"));
    }
}
