//! Read access to the tree: visitors and exhibitors.
//!
//! A [`StateVisitor`] receives callbacks for every branch (before and after
//! its children) and every leaf, in label order. `is_visitable` lets a
//! visitor prune subtrees before they are entered.
//!
//! A [`StateExhibitor`] is something a visitor can be run over:
//! [`LiveView`] shows the tree as it is, [`FutureView`] shows the tree as it
//! will be once a pending [`Transition`] commits, without mutating anything.

use std::collections::{BTreeMap, BTreeSet};

use crate::component::{Component, Composite, Payload, StateValue};
use crate::metadata::BranchMetadata;
use crate::path::Path;
use crate::transition::Transition;

/// Callbacks invoked while walking a view of the tree.
///
/// All methods have empty defaults so a visitor implements only what it
/// needs.
pub trait StateVisitor {
    /// Whether the node at `path` (and so its subtree) should be visited.
    fn is_visitable(&self, _path: &Path) -> bool {
        true
    }

    fn visit_composite_pre_descend(&mut self, _path: &Path, _metadata: Option<&BranchMetadata>) {}

    fn visit_composite_post_descend(&mut self, _path: &Path, _metadata: Option<&BranchMetadata>) {}

    fn visit_boolean(&mut self, _path: &Path, _value: bool) {}

    fn visit_integer(&mut self, _path: &Path, _value: i64) {}

    fn visit_string(&mut self, _path: &Path, _value: &str) {}

    fn visit_float(&mut self, _path: &Path, _value: f64) {}
}

/// A view of the tree that visitors can walk.
pub trait StateExhibitor {
    fn visit(&self, visitor: &mut dyn StateVisitor);
}

fn visit_value(value: &StateValue, path: &Path, visitor: &mut dyn StateVisitor) {
    match value.payload() {
        Payload::Boolean(v) => visitor.visit_boolean(path, *v),
        Payload::Integer(v) => visitor.visit_integer(path, *v),
        Payload::String(v) => visitor.visit_string(path, v),
        Payload::Float(v) => visitor.visit_float(path, *v),
    }
}

/// The tree as it currently is.
#[derive(Debug, Clone, Copy)]
pub struct LiveView<'a> {
    root: &'a Composite,
}

impl<'a> LiveView<'a> {
    /// A view of the live tree rooted at `root`.
    pub fn new(root: &'a Composite) -> Self {
        Self { root }
    }
}

impl StateExhibitor for LiveView<'_> {
    fn visit(&self, visitor: &mut dyn StateVisitor) {
        visit_live_composite(self.root, &Path::root(), visitor);
    }
}

fn visit_live_composite(branch: &Composite, path: &Path, visitor: &mut dyn StateVisitor) {
    visitor.visit_composite_pre_descend(path, branch.metadata());
    for (name, child) in branch.children() {
        let child_path = path.child(name);
        if !visitor.is_visitable(&child_path) {
            continue;
        }
        match child {
            Component::Value(v) => visit_value(v, &child_path, visitor),
            Component::Composite(c) => visit_live_composite(c, &child_path, visitor),
        }
    }
    visitor.visit_composite_post_descend(path, branch.metadata());
}

/// The tree as it will be after `transition` commits.
#[derive(Debug, Clone, Copy)]
pub struct FutureView<'a> {
    root: &'a Composite,
    transition: &'a Transition,
}

impl<'a> FutureView<'a> {
    /// A view of `root` as it will be after `transition` commits.
    pub fn new(root: &'a Composite, transition: &'a Transition) -> Self {
        Self { root, transition }
    }
}

impl StateExhibitor for FutureView<'_> {
    fn visit(&self, visitor: &mut dyn StateVisitor) {
        let mut ctx = FutureContext::default();
        visit_future_branch(&[self.root], &Path::root(), self.transition, visitor, &mut ctx);
    }
}

/// Per-traversal state for a future-view walk: subtrees the transition
/// removes.
#[derive(Debug, Default)]
struct FutureContext {
    banned: Vec<Path>,
}

impl FutureContext {
    fn ban(&mut self, path: Path) {
        self.banned.push(path);
    }

    fn is_banned(&self, path: &Path) -> bool {
        self.banned.iter().any(|b| b.equals_or_has_child(path))
    }
}

/// A child as it will look after the commit.
///
/// A branch is a stack of layers: the live branch (if any) followed by each
/// pending branch that will be installed over it. Later layers win per
/// child label, mirroring the commit's merge of replaced branches.
enum FutureChild<'a> {
    Value(&'a StateValue),
    Branch(Vec<&'a Composite>),
}

fn visit_future_branch(
    layers: &[&Composite],
    path: &Path,
    transition: &Transition,
    visitor: &mut dyn StateVisitor,
    ctx: &mut FutureContext,
) {
    let metadata = layers.iter().rev().find_map(|c| c.metadata());
    visitor.visit_composite_pre_descend(path, metadata);

    let mut children: BTreeMap<&str, FutureChild<'_>> = BTreeMap::new();
    for layer in layers {
        for (name, child) in layer.children() {
            let future = match child {
                Component::Value(v) => FutureChild::Value(v),
                Component::Composite(c) => FutureChild::Branch(vec![c]),
            };
            children.insert(name, future);
        }
    }

    if let Some(cs) = transition.change_set(path) {
        for name in cs.removed() {
            children.remove(name);
            ctx.ban(path.child(name));
        }
        for (name, new) in cs.updated().chain(cs.added()) {
            let future = match (new, children.remove(name)) {
                (Component::Value(v), _) => FutureChild::Value(v),
                (Component::Composite(c), Some(FutureChild::Branch(mut stack))) => {
                    stack.push(c);
                    FutureChild::Branch(stack)
                }
                (Component::Composite(c), _) => FutureChild::Branch(vec![c]),
            };
            children.insert(name, future);
        }
    }

    for (name, child) in &children {
        let child_path = path.child(name);
        if ctx.is_banned(&child_path) || !visitor.is_visitable(&child_path) {
            continue;
        }
        match child {
            FutureChild::Value(v) => visit_value(v, &child_path, visitor),
            FutureChild::Branch(stack) => {
                visit_future_branch(stack, &child_path, transition, visitor, ctx);
            }
        }
    }

    visitor.visit_composite_post_descend(path, metadata);
}

/// Collects every leaf at or below a prefix, pruning all other subtrees.
#[derive(Debug, Clone, Default)]
pub struct ValueCollector {
    prefix: Path,
    values: BTreeMap<Path, Payload>,
    branches: BTreeSet<Path>,
}

impl ValueCollector {
    /// Collect from the whole tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect only at or below `prefix`.
    pub fn under(prefix: Path) -> Self {
        Self {
            prefix,
            ..Self::default()
        }
    }

    /// Run this collector over `view` and return it.
    pub fn collect(mut self, view: &dyn StateExhibitor) -> Self {
        view.visit(&mut self);
        self
    }

    /// The collected payload at `path`.
    pub fn get(&self, path: &Path) -> Option<&Payload> {
        self.values.get(path)
    }

    /// Every collected payload, keyed by path.
    pub fn values(&self) -> &BTreeMap<Path, Payload> {
        &self.values
    }

    /// Consume the collector, returning the collected payloads.
    pub fn into_values(self) -> BTreeMap<Path, Payload> {
        self.values
    }

    /// Branches seen at or below the prefix.
    pub fn branches(&self) -> &BTreeSet<Path> {
        &self.branches
    }

    fn record(&mut self, path: &Path, payload: Payload) {
        if self.prefix.equals_or_has_child(path) {
            self.values.insert(path.clone(), payload);
        }
    }
}

impl StateVisitor for ValueCollector {
    fn is_visitable(&self, path: &Path) -> bool {
        self.prefix.equals_or_has_child(path) || path.is_ancestor_of(&self.prefix)
    }

    fn visit_composite_pre_descend(&mut self, path: &Path, _metadata: Option<&BranchMetadata>) {
        if self.prefix.equals_or_has_child(path) {
            self.branches.insert(path.clone());
        }
    }

    fn visit_boolean(&mut self, path: &Path, value: bool) {
        self.record(path, Payload::Boolean(value));
    }

    fn visit_integer(&mut self, path: &Path, value: i64) {
        self.record(path, Payload::Integer(value));
    }

    fn visit_string(&mut self, path: &Path, value: &str) {
        self.record(path, Payload::String(value.to_string()));
    }

    fn visit_float(&mut self, path: &Path, value: f64) {
        self.record(path, Payload::Float(value));
    }
}
