//! Tree mutation engine.
//!
//! Three builders record proposed changes into a [`Transition`] without
//! touching the live tree:
//!
//! - [`Composite::build_transition`] for one upsert,
//! - [`Composite::build_removal_transition`] for expired (or all) children,
//! - [`Composite::build_purge_transition`] for everything under a path.
//!
//! [`Composite::apply_transition`] is the commit phase and the only code
//! that mutates the live tree.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::component::{Component, Composite};
use crate::error::{StateError, StateResult};
use crate::metadata::MetadataRegistry;
use crate::path::Path;
use crate::transition::Transition;

/// Lifetime of a branch created implicitly to hold a new child.
pub const DEFAULT_BRANCH_LIFETIME: Duration = Duration::from_secs(10);

/// Inputs needed while building a transition from upserts.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub now: Instant,
    pub branch_lifetime: Duration,
    pub metadata: &'a MetadataRegistry,
}

impl<'a> BuildContext<'a> {
    /// A context using the default branch lifetime.
    pub fn new(now: Instant, metadata: &'a MetadataRegistry) -> Self {
        Self {
            now,
            branch_lifetime: DEFAULT_BRANCH_LIFETIME,
            metadata,
        }
    }

    /// Override the lifetime of implicitly created branches.
    pub fn with_branch_lifetime(mut self, lifetime: Duration) -> Self {
        self.branch_lifetime = lifetime;
        self
    }
}

impl Composite {
    /// Record in `transition` the changes needed to place `new` at
    /// `our_path + target`.
    ///
    /// Missing intermediate branches are created mortal with the context's
    /// branch lifetime. Fails with `BadPath` for an empty target and with
    /// `NotABranch` if an intermediate label names a leaf; on failure the
    /// transition is left untouched.
    pub fn build_transition(
        &self,
        our_path: &Path,
        target: &Path,
        new: &Component,
        transition: &mut Transition,
        ctx: &BuildContext<'_>,
    ) -> StateResult<()> {
        if target.is_root() {
            return Err(StateError::BadPath(format!(
                "cannot replace branch {our_path} itself"
            )));
        }
        self.check_descent(our_path, target, transition)?;
        self.build_at(our_path, target, new, transition, ctx)
    }

    /// Walk the intermediate labels of `target` the same way `build_at` will,
    /// failing if any of them is (or is about to become) a leaf.
    fn check_descent(
        &self,
        our_path: &Path,
        target: &Path,
        transition: &Transition,
    ) -> StateResult<()> {
        let mut node = Some(self);
        let mut path = our_path.clone();
        let depth = target.len() - 1;

        for name in target.labels().take(depth) {
            let child_path = path.child(name);
            let live = node.and_then(|n| n.child(name));
            let next = match live {
                Some(Component::Composite(c)) => Some(c),
                Some(Component::Value(_)) => return Err(StateError::NotABranch(child_path)),
                None => match transition.change_set(&path).and_then(|cs| cs.added_child(name)) {
                    Some(Component::Composite(c)) => Some(c),
                    Some(Component::Value(_)) => {
                        return Err(StateError::NotABranch(child_path));
                    }
                    None => None,
                },
            };
            node = next;
            path = child_path;
        }
        Ok(())
    }

    fn build_at(
        &self,
        our_path: &Path,
        remaining: &Path,
        new: &Component,
        transition: &mut Transition,
        ctx: &BuildContext<'_>,
    ) -> StateResult<()> {
        let Some(name) = remaining.first_label() else {
            return Err(StateError::BadPath(our_path.to_string()));
        };
        let child_path = our_path.child(name);
        let cs = transition.get_or_create(our_path);

        if self.mortality().is_mortal() {
            if let Some(at) = new.mortality().expiry() {
                cs.record_new_expiry(at);
            }
        }
        if new.mortality().is_immortal() {
            cs.record_immortal_child();
        }
        cs.ensure_not_removed(name);

        if remaining.is_simple() {
            let mut new = new.clone();
            if let Component::Composite(c) = &mut new {
                if c.metadata().is_none() {
                    c.set_metadata(ctx.metadata.lookup(&child_path));
                }
            }
            if self.contains_child(name) {
                cs.record_updated(name, new);
            } else {
                cs.record_added(name, new);
            }
            return Ok(());
        }

        cs.record_traversed(name);

        let pending: Composite;
        let child = match self.child(name) {
            Some(Component::Composite(c)) => c,
            Some(Component::Value(_)) => return Err(StateError::NotABranch(child_path)),
            None => {
                pending = match cs.added_child(name) {
                    Some(Component::Composite(c)) => c.clone(),
                    Some(Component::Value(_)) => {
                        return Err(StateError::NotABranch(child_path));
                    }
                    None => {
                        let mut branch = Composite::mortal(ctx.now, ctx.branch_lifetime);
                        branch.set_metadata(ctx.metadata.lookup(&child_path));
                        cs.record_added(name, branch.clone().into());
                        branch
                    }
                };
                &pending
            }
        };

        child.build_at(&child_path, &remaining.child_path(), new, transition, ctx)
    }

    /// Record removal of every child that has expired by `now`, or of every
    /// child if `forced`.
    ///
    /// Children whose cached earliest descendant expiry is still in the
    /// future are skipped without descending. A removed branch is also
    /// descended into with `forced` set, so its whole subtree is recorded
    /// as removed.
    pub fn build_removal_transition(
        &self,
        our_path: &Path,
        transition: &mut Transition,
        forced: bool,
        now: Instant,
    ) {
        for (name, child) in self.children() {
            let remove = forced || child.has_expired(now);
            let due_below = child
                .earliest_descendant_expiry()
                .is_some_and(|at| at <= now);
            let Component::Composite(branch) = child else {
                if remove {
                    transition.get_or_create(our_path).record_removed(name);
                }
                continue;
            };
            if !remove && !due_below {
                continue;
            }

            let cs = transition.get_or_create(our_path);
            if remove {
                debug!(path = %our_path, child = name, "registering child for removal");
                cs.record_removed(name);
            }
            cs.record_traversed(name);
            branch.build_removal_transition(&our_path.child(name), transition, remove, now);
        }
    }

    /// Record removal of everything at and below `our_path + remaining`.
    /// An empty `remaining` removes all children of this branch.
    pub fn build_purge_transition(
        &self,
        our_path: &Path,
        remaining: &Path,
        transition: &mut Transition,
        now: Instant,
    ) -> StateResult<()> {
        let Some(name) = remaining.first_label() else {
            transition.get_or_create(our_path);
            self.build_removal_transition(our_path, transition, true, now);
            return Ok(());
        };

        let child_path = our_path.child(name);
        let missing = || StateError::NoSuchPath(our_path.new_child_path(remaining));
        let child = self.child(name).ok_or_else(missing)?;
        if !remaining.is_simple() && !child.is_composite() {
            return Err(missing());
        }

        let cs = transition.get_or_create(our_path);
        if remaining.is_simple() {
            cs.record_removed(name);
        }
        if let Component::Composite(branch) = child {
            cs.record_traversed(name);
            branch.build_purge_transition(&child_path, &remaining.child_path(), transition, now)?;
        }
        Ok(())
    }

    /// Commit the change set recorded for `our_path`, then recurse into
    /// traversed children. Branches without a change set are untouched.
    pub fn apply_transition(&mut self, our_path: &Path, transition: &mut Transition) {
        let Some(cs) = transition.take(our_path) else {
            return;
        };
        let parts = cs.into_parts();

        if let Some(at) = parts.new_expiry {
            self.extend_expiry(at);
        }
        if parts.has_immortal_child {
            self.become_immortal();
        }

        for name in &parts.removed {
            debug!(path = %our_path, child = %name, "removing child");
            self.children_mut().remove(name);
        }
        for (name, child) in parts.updated.into_iter().chain(parts.added) {
            self.install_child(name, child);
        }

        for name in &parts.traversed {
            match self.children_mut().get_mut(name) {
                Some(Component::Composite(branch)) => {
                    branch.apply_transition(&our_path.child(name), transition);
                }
                Some(Component::Value(_)) => {}
                None if parts.removed.contains(name) => {}
                None => {
                    warn!(path = %our_path, child = %name, "traversed child is missing");
                }
            }
        }

        self.recalc_earliest_descendant_expiry();
    }

    /// Commit a whole transition, treating this branch as the tree root.
    pub fn commit(&mut self, mut transition: Transition) {
        self.apply_transition(&Path::root(), &mut transition);
    }

    /// Install an added or updated child. A branch replacing a branch keeps
    /// the existing grandchildren it does not mention.
    fn install_child(&mut self, name: String, child: Component) {
        let existing = self.children_mut().remove(&name);
        let child = match (child, existing) {
            (Component::Composite(mut incoming), Some(Component::Composite(existing))) => {
                incoming.merge_replaced(existing);
                Component::Composite(incoming)
            }
            (child, _) => child,
        };
        self.children_mut().insert(name, child);
    }
}
