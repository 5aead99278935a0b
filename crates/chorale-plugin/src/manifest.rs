//! Plugin identity and the permission manifest.
//!
//! A plugin declares up front which host services it wants; the sandbox is
//! then built with exactly those service bindings and nothing else. Grants
//! are stored raw here and interpreted by the service that owns them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

// ─── Identity ───────────────────────────────────────────────────────────

/// Stable identity of a plugin: name plus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginId {
    pub name: String,
    pub version: String,
}

impl PluginId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

// ─── Permission manifest ────────────────────────────────────────────────

/// A single service grant. Every grant carries a human-readable reason;
/// service-specific constraints stay as raw JSON and are interpreted by
/// the host service that owns the grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub reason: String,
    #[serde(flatten, default)]
    pub constraints: serde_json::Map<String, serde_json::Value>,
}

/// Per-service grants. A present field means the service is granted and
/// its host bindings get linked into the sandbox; an absent field means
/// the service is never reachable from guest code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Grant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<Grant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Grant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<Grant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<Grant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<Grant>,
}

impl Permissions {
    /// Names of services with a present grant, in declaration order.
    pub fn granted_services(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.config.is_some() {
            out.push("config");
        }
        if self.scheduler.is_some() {
            out.push("scheduler");
        }
        if self.cache.is_some() {
            out.push("cache");
        }
        if self.artwork.is_some() {
            out.push("artwork");
        }
        if self.http.is_some() {
            out.push("http");
        }
        if self.websocket.is_some() {
            out.push("websocket");
        }
        out
    }
}

/// Declared manifest shipped next to the plugin module.
///
/// The capability list here is advisory only; what the module actually
/// exports decides which capabilities the plugin holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub permissions: Permissions,
    /// Plugin-specific settings exposed to the guest via the config service.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl PluginManifest {
    pub fn parse(raw: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest = serde_json::from_str(raw)?;
        if manifest.name.is_empty() {
            return Err(PluginError::Construction(
                "manifest is missing a plugin name".to_string(),
            ));
        }
        if manifest.version.is_empty() {
            return Err(PluginError::Construction(
                "manifest is missing a plugin version".to_string(),
            ));
        }
        Ok(manifest)
    }

    pub fn id(&self) -> PluginId {
        PluginId::new(self.name.clone(), self.version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_id_display() {
        let id = PluginId::new("lastfm", "1.2.0");
        assert_eq!(id.to_string(), "lastfm@1.2.0");
    }

    #[test]
    fn test_plugin_id_hash_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(PluginId::new("lastfm", "1.0.0"));
        assert!(set.contains(&PluginId::new("lastfm", "1.0.0")));
        assert!(!set.contains(&PluginId::new("lastfm", "1.0.1")));
    }

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest = PluginManifest::parse(r#"{"name": "discogs", "version": "0.3.1"}"#).unwrap();
        assert_eq!(manifest.id().to_string(), "discogs@0.3.1");
        assert!(manifest.permissions.granted_services().is_empty());
        assert!(manifest.capabilities.is_empty());
    }

    #[test]
    fn test_parse_manifest_with_grants() {
        let raw = r#"{
            "name": "lastfm",
            "version": "1.0.0",
            "capabilities": ["MetadataAgent", "Scrobbler"],
            "permissions": {
                "http": {
                    "reason": "Query the Last.fm API",
                    "allowedUrls": {"https://ws.audioscrobbler.com/*": ["GET", "POST"]}
                },
                "scheduler": {"reason": "Retry failed scrobbles"}
            }
        }"#;

        let manifest = PluginManifest::parse(raw).unwrap();
        assert_eq!(
            manifest.permissions.granted_services(),
            vec!["scheduler", "http"]
        );

        let http = manifest.permissions.http.as_ref().unwrap();
        assert_eq!(http.reason, "Query the Last.fm API");
        assert!(http.constraints.contains_key("allowedUrls"));
    }

    #[test]
    fn test_parse_rejects_missing_name() {
        let err = PluginManifest::parse(r#"{"name": "", "version": "1.0.0"}"#).unwrap_err();
        assert!(matches!(err, PluginError::Construction(_)));
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let err = PluginManifest::parse("{not json").unwrap_err();
        assert!(matches!(err, PluginError::Serialization(_)));
    }

    #[test]
    fn test_grant_with_trivial_constraints_still_granted() {
        let raw = r#"{
            "name": "p",
            "version": "1.0.0",
            "permissions": {"cache": {"reason": "Memoize API responses"}}
        }"#;
        let manifest = PluginManifest::parse(raw).unwrap();
        assert_eq!(manifest.permissions.granted_services(), vec!["cache"]);
    }
}
