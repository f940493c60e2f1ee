//! Diff-merge engine: converge a stored composite toward an observed one
//!
//! The engine is policy-free and pure: given the stored composite (if any)
//! and the observed composite, it computes the minimal set of parent and
//! child writes as a [`MergePlan`]. Per-kind policy — the child natural key,
//! field-equality predicates, merge rules for manually owned fields, and the
//! empty-parent cascade — lives in each kind's [`CompositeKind`]
//! implementation.
//!
//! Children never reference their parent by live object pointer; identity is
//! the `(cluster, namespace, name)` tuple plus the child natural key, so the
//! engine works on plain keyed collections.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

/// A parent row together with its owned child rows
#[derive(Debug, Clone, PartialEq)]
pub struct Composite<P, C> {
    /// Parent row
    pub parent: P,
    /// Owned child rows; order is irrelevant, identity is the natural key
    pub children: Vec<C>,
}

impl<P, C> Composite<P, C> {
    /// Composite with no children
    pub fn childless(parent: P) -> Self {
        Self {
            parent,
            children: Vec::new(),
        }
    }
}

/// How a kind's rows are removed when the live object disappears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Remove parent and child rows entirely
    Hard,
    /// Mark the parent row deleted, removing child rows
    Soft,
}

/// Per-kind parameterization of the diff-merge engine
pub trait CompositeKind: Send + Sync + 'static {
    /// Parent row type
    type Parent: Clone + Debug + Send + Sync + 'static;
    /// Child row type
    type Child: Clone + Debug + Send + Sync + 'static;

    /// Kind name for logs and store diagnostics
    const KIND: &'static str;

    /// Whether a parent with zero remaining children is deleted outright
    const CASCADE_ON_EMPTY: bool = false;

    /// How stored rows are removed when the live object is gone
    const DELETE: DeletePolicy = DeletePolicy::Hard;

    /// Natural key identifying a child within its parent
    fn child_key(child: &Self::Child) -> String;

    /// Whether any mirrored parent scalar differs
    fn parent_changed(stored: &Self::Parent, observed: &Self::Parent) -> bool;

    /// Whether any mirrored child field differs
    fn child_changed(stored: &Self::Child, observed: &Self::Child) -> bool;

    /// Merge observed parent scalars into the stored row, preserving primary
    /// key, audit fields, and any manually owned fields
    fn merge_parent(stored: &Self::Parent, observed: &Self::Parent) -> Self::Parent;

    /// Merge observed child fields into the stored row, preserving primary
    /// key and parent back-reference
    fn merge_child(stored: &Self::Child, observed: &Self::Child) -> Self::Child;
}

/// Minimal write set converging stored state to observed state
#[derive(Debug, Clone)]
pub struct MergePlan<P, C> {
    /// Insert this parent row (no stored counterpart existed)
    pub create_parent: Option<P>,
    /// Update the parent row in place
    pub update_parent: Option<P>,
    /// Delete the parent row (empty-parent cascade)
    pub delete_parent: bool,
    /// Child rows to insert
    pub insert_children: Vec<C>,
    /// Child rows to update in place
    pub update_children: Vec<C>,
    /// Natural keys of child rows to delete
    pub delete_children: Vec<String>,
}

impl<P, C> Default for MergePlan<P, C> {
    fn default() -> Self {
        Self {
            create_parent: None,
            update_parent: None,
            delete_parent: false,
            insert_children: Vec::new(),
            update_children: Vec::new(),
            delete_children: Vec::new(),
        }
    }
}

impl<P, C> MergePlan<P, C> {
    /// Whether applying this plan writes nothing
    pub fn is_noop(&self) -> bool {
        self.create_parent.is_none()
            && self.update_parent.is_none()
            && !self.delete_parent
            && self.insert_children.is_empty()
            && self.update_children.is_empty()
            && self.delete_children.is_empty()
    }

    /// Total number of row writes this plan performs
    pub fn write_count(&self) -> usize {
        usize::from(self.create_parent.is_some())
            + usize::from(self.update_parent.is_some())
            + usize::from(self.delete_parent)
            + self.insert_children.len()
            + self.update_children.len()
            + self.delete_children.len()
    }
}

/// Compute the minimal write set for one kind
///
/// Re-running with an unchanged observed composite against the plan's own
/// output yields a no-op plan.
pub fn plan<K: CompositeKind>(
    stored: Option<&Composite<K::Parent, K::Child>>,
    observed: &Composite<K::Parent, K::Child>,
) -> MergePlan<K::Parent, K::Child> {
    let mut out = MergePlan::default();

    let Some(stored) = stored else {
        // First sync of this key. A kind that cascades on empty never
        // materializes a parent that would be deleted in the same breath.
        if K::CASCADE_ON_EMPTY && observed.children.is_empty() {
            return out;
        }
        out.create_parent = Some(observed.parent.clone());
        out.insert_children = dedup_by_key::<K>(&observed.children);
        return out;
    };

    if K::CASCADE_ON_EMPTY && observed.children.is_empty() {
        out.delete_parent = true;
        out.delete_children = stored.children.iter().map(K::child_key).collect();
        return out;
    }

    if K::parent_changed(&stored.parent, &observed.parent) {
        out.update_parent = Some(K::merge_parent(&stored.parent, &observed.parent));
    }

    let stored_by_key: HashMap<String, &K::Child> = stored
        .children
        .iter()
        .map(|c| (K::child_key(c), c))
        .collect();

    let mut matched: HashSet<String> = HashSet::new();
    for child in dedup_by_key::<K>(&observed.children) {
        let key = K::child_key(&child);
        match stored_by_key.get(&key) {
            Some(existing) => {
                matched.insert(key);
                if K::child_changed(existing, &child) {
                    out.update_children.push(K::merge_child(existing, &child));
                }
            }
            None => out.insert_children.push(child),
        }
    }

    for (key, _) in stored_by_key {
        if !matched.contains(&key) {
            out.delete_children.push(key);
        }
    }

    out
}

/// Observed children deduplicated by natural key, first occurrence wins
fn dedup_by_key<K: CompositeKind>(children: &[K::Child]) -> Vec<K::Child> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(children.len());
    for child in children {
        if seen.insert(K::child_key(child)) {
            out.push(child.clone());
        }
    }
    out
}
