//! Namespace allow-list filtering
//!
//! Sync handlers consult the filter before doing any work: a key whose
//! namespace is not allowed returns success with no side effect, so mirrored
//! state never accumulates for namespaces the operator has scoped out.
//! Cluster-scoped keys (no namespace) always pass.

use std::collections::BTreeSet;

/// Namespace allow-list; empty means all namespaces are allowed
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    allowed: BTreeSet<String>,
}

impl NamespaceFilter {
    /// Filter that allows every namespace
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Filter restricted to the given namespaces
    pub fn allow_only<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether objects in `namespace` should be mirrored
    ///
    /// `None` (cluster-scoped) always passes.
    pub fn allows(&self, namespace: Option<&str>) -> bool {
        match namespace {
            None => true,
            Some(ns) => self.allowed.is_empty() || self.allowed.contains(ns),
        }
    }
}
