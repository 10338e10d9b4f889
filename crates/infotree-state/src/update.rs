//! Producer-facing update batches.

use std::time::Instant;

use tracing::{debug, warn};

use crate::component::{Component, Composite};
use crate::error::StateError;
use crate::path::Path;
use crate::transition::Transition;
use crate::tree::BuildContext;

/// A batch of purges and upserts, applied together as one transition.
///
/// Purges are recorded before upserts, so an update may clear a subtree
/// and repopulate part of it in one step.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    purges: Vec<Path>,
    upserts: Vec<(Path, Component)>,
}

impl StateUpdate {
    /// An empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `path` to `component`, creating missing branches.
    pub fn append_update(&mut self, path: Path, component: Component) {
        self.upserts.push((path, component));
    }

    /// Builder form of [`StateUpdate::append_update`].
    pub fn with_update(mut self, path: Path, component: Component) -> Self {
        self.append_update(path, component);
        self
    }

    /// Remove everything at and below `path`.
    pub fn purge_under(&mut self, path: Path) {
        self.purges.push(path);
    }

    /// Builder form of [`StateUpdate::purge_under`].
    pub fn with_purge(mut self, path: Path) -> Self {
        self.purge_under(path);
        self
    }

    /// Append every purge and upsert of `other` after this update's own.
    pub fn extend(&mut self, other: StateUpdate) {
        self.purges.extend(other.purges);
        self.upserts.extend(other.upserts);
    }

    /// Upserts in submission order.
    pub fn upserts(&self) -> impl Iterator<Item = (&Path, &Component)> {
        self.upserts.iter().map(|(p, c)| (p, c))
    }

    /// Purges in submission order.
    pub fn purges(&self) -> impl Iterator<Item = &Path> {
        self.purges.iter()
    }

    /// Total number of purges and upserts.
    pub fn count(&self) -> usize {
        self.purges.len() + self.upserts.len()
    }

    /// Whether the update contains nothing.
    pub fn is_empty(&self) -> bool {
        self.purges.is_empty() && self.upserts.is_empty()
    }

    /// Translate this update into a transition against `root`.
    ///
    /// Entries that fail (a path through a leaf, a purge of a missing path)
    /// are logged and skipped; the remaining entries still apply.
    pub fn build_transition(&self, root: &Composite, ctx: &BuildContext<'_>) -> Transition {
        let mut transition = Transition::new();
        let root_path = Path::root();

        for path in &self.purges {
            match root.build_purge_transition(&root_path, path, &mut transition, ctx.now) {
                Ok(()) => {}
                Err(e @ StateError::NoSuchPath(_)) => {
                    debug!(%path, error = %e, "nothing to purge");
                }
                Err(e) => warn!(%path, error = %e, "skipping purge"),
            }
        }

        for (path, component) in &self.upserts {
            if let Err(e) = root.build_transition(&root_path, path, component, &mut transition, ctx) {
                warn!(%path, error = %e, "skipping upsert");
            }
        }

        transition
    }
}

/// Build the transition that removes every child of `root` expired at `now`.
pub fn build_expiry_transition(root: &Composite, now: Instant) -> Transition {
    let mut transition = Transition::new();
    root.build_removal_transition(&Path::root(), &mut transition, false, now);
    transition
}
