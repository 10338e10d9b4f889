//! Pending changes: per-branch change sets aggregated into a transition.
//!
//! A [`Transition`] is one atomic, not-yet-committed change to the whole
//! tree. It maps the path of every affected branch to a [`ChangeSet`]
//! describing what happens to that branch's children. Building a
//! transition only reads the live tree; committing it is the only
//! operation that mutates the tree (see [`crate::tree`]).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use crate::component::Component;
use crate::path::Path;

/// Pending delta for the children of one branch.
///
/// A child has at most one disposition: recording it as added, updated or
/// removed clears any earlier record of the same child in the other two.
/// `traversed` is independent: it marks children the commit must descend
/// into because something below them changes.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    added: BTreeMap<String, Component>,
    updated: BTreeMap<String, Component>,
    removed: BTreeSet<String>,
    traversed: BTreeSet<String>,
    new_expiry: Option<Instant>,
    has_immortal_child: bool,
}

impl ChangeSet {
    /// Record `child` as new under this branch.
    pub fn record_added(&mut self, name: &str, child: Component) {
        self.updated.remove(name);
        self.removed.remove(name);
        self.added.insert(name.to_string(), child);
    }

    /// Record `child` as replacing the existing child `name`.
    pub fn record_updated(&mut self, name: &str, child: Component) {
        self.added.remove(name);
        self.removed.remove(name);
        self.updated.insert(name.to_string(), child);
    }

    /// Record removal of the child `name`.
    pub fn record_removed(&mut self, name: &str) {
        self.added.remove(name);
        self.updated.remove(name);
        self.removed.insert(name.to_string());
    }

    /// Mark `name` as holding changes further down.
    pub fn record_traversed(&mut self, name: &str) {
        self.traversed.insert(name.to_string());
    }

    /// Cancel a pending removal of `name`, if any.
    pub fn ensure_not_removed(&mut self, name: &str) {
        self.removed.remove(name);
    }

    /// Propose a new expiry for the owning branch. The latest proposal wins.
    pub fn record_new_expiry(&mut self, at: Instant) {
        if self.new_expiry.is_none_or(|current| at > current) {
            self.new_expiry = Some(at);
        }
    }

    /// Mark this branch as gaining an immortal descendant.
    pub fn record_immortal_child(&mut self) {
        self.has_immortal_child = true;
    }

    /// Children recorded as added, in label order.
    pub fn added(&self) -> impl Iterator<Item = (&str, &Component)> {
        self.added.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Children recorded as updated, in label order.
    pub fn updated(&self) -> impl Iterator<Item = (&str, &Component)> {
        self.updated.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of children recorded as removed.
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.removed.iter().map(String::as_str)
    }

    /// Names of children with changes further down.
    pub fn traversed(&self) -> impl Iterator<Item = &str> {
        self.traversed.iter().map(String::as_str)
    }

    /// The pending new child `name`, if it is added.
    pub fn added_child(&self, name: &str) -> Option<&Component> {
        self.added.get(name)
    }

    /// The pending replacement for child `name`, if it is updated.
    pub fn updated_child(&self, name: &str) -> Option<&Component> {
        self.updated.get(name)
    }

    /// The new value of an added or updated child.
    pub fn new_child_value(&self, name: &str) -> Option<&Component> {
        self.added.get(name).or_else(|| self.updated.get(name))
    }

    /// Whether the child `name` is recorded as removed.
    pub fn is_removed(&self, name: &str) -> bool {
        self.removed.contains(name)
    }

    /// Whether the child `name` has changes further down.
    pub fn is_traversed(&self, name: &str) -> bool {
        self.traversed.contains(name)
    }

    /// Whether this change set touches `name` in any way.
    pub fn has_child_changed(&self, name: &str) -> bool {
        self.added.contains_key(name)
            || self.updated.contains_key(name)
            || self.removed.contains(name)
            || self.traversed.contains(name)
    }

    /// Proposed new expiry for the owning branch.
    pub fn new_expiry(&self) -> Option<Instant> {
        self.new_expiry
    }

    /// Whether the owning branch becomes immortal on commit.
    pub fn has_immortal_child(&self) -> bool {
        self.has_immortal_child
    }

    /// Number of children added, updated or removed here.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    pub(crate) fn into_parts(self) -> ChangeSetParts {
        ChangeSetParts {
            added: self.added,
            updated: self.updated,
            removed: self.removed,
            traversed: self.traversed,
            new_expiry: self.new_expiry,
            has_immortal_child: self.has_immortal_child,
        }
    }
}

/// Owned contents of a change set, consumed by the commit phase.
pub(crate) struct ChangeSetParts {
    pub added: BTreeMap<String, Component>,
    pub updated: BTreeMap<String, Component>,
    pub removed: BTreeSet<String>,
    pub traversed: BTreeSet<String>,
    pub new_expiry: Option<Instant>,
    pub has_immortal_child: bool,
}

/// One atomic, uncommitted change to the tree.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    change_sets: HashMap<Path, ChangeSet>,
}

impl Transition {
    /// An empty transition.
    pub fn new() -> Self {
        Self::default()
    }

    /// The change set recorded for the branch at `path`.
    pub fn change_set(&self, path: &Path) -> Option<&ChangeSet> {
        self.change_sets.get(path)
    }

    /// The change set for the branch at `path`, created if missing.
    pub fn get_or_create(&mut self, path: &Path) -> &mut ChangeSet {
        self.change_sets.entry(path.clone()).or_default()
    }

    pub(crate) fn take(&mut self, path: &Path) -> Option<ChangeSet> {
        self.change_sets.remove(path)
    }

    /// Paths of every branch with a change set, in no particular order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.change_sets.keys()
    }

    /// Total number of children added, updated or removed.
    pub fn change_count(&self) -> usize {
        self.change_sets.values().map(ChangeSet::change_count).sum()
    }

    /// True when committing would change nothing: no child is added,
    /// updated or removed and no branch expiry or immortality changes.
    pub fn is_empty(&self) -> bool {
        self.change_sets.values().all(|cs| {
            cs.change_count() == 0 && cs.new_expiry.is_none() && !cs.has_immortal_child
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Mortality;
    use std::time::Duration;

    fn leaf(v: i64) -> Component {
        Component::value(v, Mortality::Ephemeral)
    }

    #[test]
    fn single_disposition_per_child() {
        let mut cs = ChangeSet::default();
        cs.record_added("x", leaf(1));
        assert!(cs.added_child("x").is_some());

        cs.record_updated("x", leaf(2));
        assert!(cs.added_child("x").is_none());
        assert_eq!(cs.updated_child("x"), Some(&leaf(2)));

        cs.record_removed("x");
        assert!(cs.updated_child("x").is_none());
        assert!(cs.is_removed("x"));

        cs.record_added("x", leaf(3));
        assert!(!cs.is_removed("x"));
        assert_eq!(cs.new_child_value("x"), Some(&leaf(3)));
        assert_eq!(cs.change_count(), 1);
    }

    #[test]
    fn traversed_is_independent_of_disposition() {
        let mut cs = ChangeSet::default();
        cs.record_removed("x");
        cs.record_traversed("x");
        assert!(cs.is_removed("x"));
        assert!(cs.is_traversed("x"));
        assert!(cs.has_child_changed("x"));
        assert!(!cs.has_child_changed("y"));
    }

    #[test]
    fn ensure_not_removed_cancels_removal() {
        let mut cs = ChangeSet::default();
        cs.record_removed("x");
        cs.ensure_not_removed("x");
        assert!(!cs.is_removed("x"));
        assert!(!cs.has_child_changed("x"));
    }

    #[test]
    fn latest_expiry_proposal_wins() {
        let now = Instant::now();
        let mut cs = ChangeSet::default();
        cs.record_new_expiry(now + Duration::from_secs(10));
        cs.record_new_expiry(now + Duration::from_secs(5));
        assert_eq!(cs.new_expiry(), Some(now + Duration::from_secs(10)));
        cs.record_new_expiry(now + Duration::from_secs(20));
        assert_eq!(cs.new_expiry(), Some(now + Duration::from_secs(20)));
    }

    #[test]
    fn transition_emptiness() {
        let mut t = Transition::new();
        assert!(t.is_empty());

        t.get_or_create(&Path::root()).record_traversed("a");
        assert!(t.is_empty());

        t.get_or_create(&Path::parse("a").unwrap())
            .record_added("b", leaf(1));
        assert!(!t.is_empty());
        assert_eq!(t.change_count(), 1);
        assert_eq!(t.paths().count(), 2);
    }
}
