//! Object keys for work-queue items and stored records
//!
//! A key identifies one live object within one cluster's scope: namespace plus
//! name for namespaced kinds, name alone for cluster-scoped kinds. Keys render
//! as `namespace/name` (or bare `name`) so queue logs match what `kubectl`
//! users expect.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Key of a single watched object: optional namespace plus name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped kinds (nodes, namespaces)
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Create a key for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Namespace of this key, or the empty string for cluster-scoped keys
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::invalid_key(s, "empty key"));
        }
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Ok(Self::cluster_scoped(name)),
            (Some(ns), Some(name), None) => {
                if ns.is_empty() || name.is_empty() {
                    return Err(Error::invalid_key(s, "empty namespace or name"));
                }
                Ok(Self::namespaced(ns, name))
            }
            _ => Err(Error::invalid_key(s, "too many separators")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_round_trip() {
        let key = ObjectKey::namespaced("default", "web");
        assert_eq!(key.to_string(), "default/web");
        let parsed: ObjectKey = "default/web".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_cluster_scoped_round_trip() {
        let key = ObjectKey::cluster_scoped("node-1");
        assert_eq!(key.to_string(), "node-1");
        let parsed: ObjectKey = "node-1".parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.namespace_or_default(), "");
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!("".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
        assert!("/name".parse::<ObjectKey>().is_err());
        assert!("ns/".parse::<ObjectKey>().is_err());
    }
}
