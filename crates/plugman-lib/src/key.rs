use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// The only version token registries commonly publish
pub const LATEST: &str = "latest";

/// Identity of a plugin, canonically written as `publisher/name/version`.
///
/// Versions are opaque tokens; `latest` is never resolved to a concrete
/// version anywhere in this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginKey {
    publisher: String,
    name: String,
    version: String,
}

impl PluginKey {
    pub fn new(
        publisher: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            publisher: publisher.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn latest(publisher: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(publisher, name, LATEST)
    }

    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The `publisher.name` form stored in the installed-plugin manifest
    pub fn manifest_id(&self) -> String {
        format!("{}.{}", self.publisher, self.name)
    }

    /// Parse a manifest entry back into a key. The manifest carries no
    /// version, so the key always points at `latest`.
    pub fn from_manifest_id(id: &str) -> Result<Self, PluginError> {
        match id.split_once('.') {
            Some((publisher, name)) if !publisher.is_empty() && !name.is_empty() => {
                Ok(Self::latest(publisher, name))
            }
            _ => Err(PluginError::InvalidKey(id.to_string())),
        }
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.publisher, self.name, self.version)
    }
}

impl FromStr for PluginKey {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(PluginError::InvalidKey(s.to_string()));
        }
        match parts.as_slice() {
            [publisher, name] => Ok(Self::latest(*publisher, *name)),
            [publisher, name, version] => Ok(Self::new(*publisher, *name, *version)),
            _ => Err(PluginError::InvalidKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for PluginKey {
    type Error = PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PluginKey> for String {
    fn from(key: PluginKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("redhat/java/latest", "redhat", "java", "latest"; "full key")]
    #[test_case("redhat/java", "redhat", "java", "latest"; "version defaults to latest")]
    #[test_case("eclipse/che-theia/next", "eclipse", "che-theia", "next"; "custom version")]
    fn test_parse_key(input: &str, publisher: &str, name: &str, version: &str) {
        let key: PluginKey = input.parse().expect("key should parse");
        assert_eq!(key.publisher(), publisher);
        assert_eq!(key.name(), name);
        assert_eq!(key.version(), version);
    }

    #[test_case(""; "empty")]
    #[test_case("redhat"; "missing name")]
    #[test_case("redhat//latest"; "empty name")]
    #[test_case("a/b/c/d"; "too many segments")]
    fn test_parse_invalid_key(input: &str) {
        assert!(matches!(
            input.parse::<PluginKey>(),
            Err(PluginError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_manifest_id() {
        let key = PluginKey::new("pub", "name", "1.0.0");
        assert_eq!(key.manifest_id(), "pub.name");
        assert_eq!(
            PluginKey::from_manifest_id("pub.name").unwrap(),
            PluginKey::latest("pub", "name")
        );
        assert!(PluginKey::from_manifest_id("pubname").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let key = PluginKey::latest("ms-python", "python");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"ms-python/python/latest\"");
        let back: PluginKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
