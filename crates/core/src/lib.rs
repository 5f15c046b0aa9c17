//! Tether core types: resource keys, admitted objects and deltas.

#![forbid(unsafe_code)]

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors raised while deriving identity from a raw object or key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("object missing metadata.name")]
    MissingName,
    #[error("invalid resource key: {0:?} (expect name or namespace/name)")]
    InvalidKey(String),
}

/// Stable identity of a resource: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }

    pub fn from_parts(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Split into `(namespace, name)`.
    pub fn split(&self) -> Result<(Option<&str>, &str), CoreError> {
        let parts: Vec<&str> = self.0.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok((None, *name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(*ns), *name)),
            _ => Err(CoreError::InvalidKey(self.0.clone())),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str { &self.0 }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str { &self.0 }
}

impl From<&str> for ResourceKey {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for ResourceKey {
    fn from(v: String) -> Self { Self(v) }
}

/// An admitted object: identity metadata plus the opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub key: ResourceKey,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    pub generation: Option<i64>,
    /// Raw object (possibly stripped of oversized fields under feature flags)
    pub raw: serde_json::Value,
}

impl ResourceObject {
    /// Read identity out of `metadata` and take ownership of the payload.
    pub fn from_raw(mut raw: serde_json::Value) -> Result<Self, CoreError> {
        let meta = raw.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(CoreError::MissingName)?
            .to_string();
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let resource_version = meta
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let generation = meta.and_then(|m| m.get("generation")).and_then(|v| v.as_i64());
        if cfg!(feature = "strip-managed-fields") {
            strip_managed_fields(&mut raw);
        }
        Ok(Self {
            key: ResourceKey::from_parts(namespace.as_deref(), &name),
            namespace,
            name,
            resource_version,
            generation,
            raw,
        })
    }

    /// Order two versions of the same object. `None` when either resource
    /// version is absent or not an integer (opaque versions cannot be ordered).
    pub fn version_cmp(&self, other: &ResourceObject) -> Option<Ordering> {
        let parse = |o: &ResourceObject| o.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok());
        Some(parse(self)?.cmp(&parse(other)?))
    }

    /// True only when `self` is provably older than `current`.
    pub fn is_stale_against(&self, current: &ResourceObject) -> bool {
        self.version_cmp(current) == Some(Ordering::Less)
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
}

/// A single observed change, as applied to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: ResourceObject,
}

impl Delta {
    pub fn key(&self) -> &ResourceKey { &self.object.key }
}

pub mod prelude {
    pub use super::{CoreError, Delta, DeltaKind, ResourceKey, ResourceObject};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_namespace_and_name() {
        let k = ResourceKey::from_parts(Some("ns"), "a");
        assert_eq!(k.as_str(), "ns/a");
        assert_eq!(k.split().unwrap(), (Some("ns"), "a"));

        let cluster = ResourceKey::from_parts(None, "node-1");
        assert_eq!(cluster.as_str(), "node-1");
        assert_eq!(cluster.split().unwrap(), (None, "node-1"));

        // empty namespace is cluster-scoped
        assert_eq!(ResourceKey::from_parts(Some(""), "x").as_str(), "x");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for bad in ["", "a/b/c", "/a", "a/"] {
            assert!(ResourceKey::from(bad).split().is_err(), "{bad:?} should not split");
        }
    }

    #[test]
    fn from_raw_reads_identity() {
        let raw = serde_json::json!({
            "metadata": {
                "name": "song-1",
                "namespace": "music",
                "resourceVersion": "42",
                "generation": 3,
                "managedFields": [{"manager": "kubectl"}],
            },
            "spec": {"title": "x"}
        });
        let obj = ResourceObject::from_raw(raw).unwrap();
        assert_eq!(obj.key.as_str(), "music/song-1");
        assert_eq!(obj.resource_version.as_deref(), Some("42"));
        assert_eq!(obj.generation, Some(3));
        assert_eq!(obj.raw["spec"]["title"], "x");
        assert!(obj.raw["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn from_raw_requires_name() {
        let err = ResourceObject::from_raw(serde_json::json!({"metadata": {}})).unwrap_err();
        assert_eq!(err, CoreError::MissingName);
    }

    #[test]
    fn numeric_versions_order() {
        let mk = |rv: &str| {
            ResourceObject::from_raw(serde_json::json!({"metadata": {"name": "a", "resourceVersion": rv}})).unwrap()
        };
        assert_eq!(mk("10").version_cmp(&mk("9")), Some(Ordering::Greater));
        assert!(mk("9").is_stale_against(&mk("10")));
        assert!(!mk("9").is_stale_against(&mk("9")));
        assert_eq!(mk("abc").version_cmp(&mk("9")), None);
        assert!(!mk("abc").is_stale_against(&mk("9")));
    }
}
