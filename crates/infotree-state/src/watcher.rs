//! Watchers: registered interest in parts of the tree.
//!
//! A watcher lists [`Predicate`]s. Before a transition commits, every
//! enabled watcher whose predicates are touched by the transition is
//! triggered with a view of the tree before and after the change, and may
//! append to a follow-up [`StateUpdate`]. The follow-up is submitted as a
//! new update, never merged into the transition being evaluated.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::component::{Component, Composite};
use crate::path::Path;
use crate::predicate::Predicate;
use crate::transition::Transition;
use crate::update::StateUpdate;
use crate::visitor::{FutureView, LiveView, StateExhibitor};

/// Something interested in changes to the tree.
pub trait StateWatcher: Send + Sync {
    /// Unique name, used to enable and disable the watcher.
    fn name(&self) -> &str;

    /// Patterns of the paths this watcher is interested in.
    fn predicates(&self) -> &[Predicate];

    /// Called when a pending transition touches one of the predicates.
    ///
    /// `current` shows the live tree, `future` the tree once the transition
    /// commits. Anything appended to `update` is applied later as a
    /// separate update.
    fn trigger(
        &self,
        update: &mut StateUpdate,
        current: &dyn StateExhibitor,
        future: &dyn StateExhibitor,
    ) -> anyhow::Result<()>;
}

type TriggerFn = dyn Fn(&mut StateUpdate, &dyn StateExhibitor, &dyn StateExhibitor) -> anyhow::Result<()>
    + Send
    + Sync;

/// A watcher backed by a closure.
pub struct FnWatcher {
    name: String,
    predicates: Vec<Predicate>,
    trigger: Box<TriggerFn>,
}

impl FnWatcher {
    /// A watcher named `name` that runs `trigger` when any of `predicates` is touched.
    pub fn new<F>(name: &str, predicates: Vec<Predicate>, trigger: F) -> Self
    where
        F: Fn(&mut StateUpdate, &dyn StateExhibitor, &dyn StateExhibitor) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            predicates,
            trigger: Box::new(trigger),
        }
    }
}

impl StateWatcher for FnWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    fn trigger(
        &self,
        update: &mut StateUpdate,
        current: &dyn StateExhibitor,
        future: &dyn StateExhibitor,
    ) -> anyhow::Result<()> {
        (self.trigger)(update, current, future)
    }
}

/// Whether `transition` changes anything matching `predicate`, where
/// `predicate` is relative to the branch at `path`.
///
/// `branch` is the branch as it exists when the transition was built: the
/// live branch, or a pending one the transition adds. Only children the
/// branch's change set touches are considered.
pub fn predicate_has_been_triggered(
    branch: Option<&Composite>,
    path: &Path,
    predicate: &Predicate,
    transition: &Transition,
) -> bool {
    let Some(cs) = transition.change_set(path) else {
        return false;
    };
    if predicate.is_empty() {
        return false;
    }
    let rest = predicate.child_predicate();

    for (name, new) in cs.added() {
        if !predicate.top_label_matches(name) {
            continue;
        }
        if predicate.is_simple() {
            return true;
        }
        if subtree_changes(None, Some(new), &rest) {
            return true;
        }
        if let Component::Composite(c) = new {
            if predicate_has_been_triggered(Some(c), &path.child(name), &rest, transition) {
                return true;
            }
        }
    }

    let Some(branch) = branch else {
        return false;
    };
    for (name, child) in branch.children() {
        if !cs.has_child_changed(name) || !predicate.top_label_matches(name) {
            continue;
        }
        if predicate.is_simple() {
            if cs.is_removed(name) {
                return true;
            }
            if cs.updated_child(name).is_some_and(|new| new != child) {
                return true;
            }
            continue;
        }

        if let Some(new) = cs.updated_child(name) {
            let changed = match (child, new) {
                (Component::Composite(old), Component::Composite(new)) => {
                    merge_changes(old, new, &rest)
                }
                _ => subtree_changes(Some(child), Some(new), &rest),
            };
            if changed {
                return true;
            }
        }
        if let Component::Composite(c) = child {
            if predicate_has_been_triggered(Some(c), &path.child(name), &rest, transition) {
                return true;
            }
        }
    }
    false
}

/// Installing branch `new` over branch `old` keeps old children that `new`
/// does not name, so only `new`'s children can change.
fn merge_changes(old: &Composite, new: &Composite, predicate: &Predicate) -> bool {
    new.children()
        .filter(|(name, _)| predicate.top_label_matches(name))
        .any(|(name, n)| {
            let o = old.child(name);
            if predicate.is_simple() {
                o != Some(n)
            } else {
                subtree_changes(o, Some(n), &predicate.child_predicate())
            }
        })
}

/// Whether replacing `old` wholesale with `new` changes any node matching
/// `predicate` below them.
fn subtree_changes(
    old: Option<&Component>,
    new: Option<&Component>,
    predicate: &Predicate,
) -> bool {
    let old = old.and_then(Component::as_composite);
    let new = new.and_then(Component::as_composite);
    let labels = old
        .into_iter()
        .chain(new)
        .flat_map(|c| c.children().map(|(name, _)| name))
        .filter(|name| predicate.top_label_matches(name));

    for name in labels {
        let o = old.and_then(|c| c.child(name));
        let n = new.and_then(|c| c.child(name));
        let changed = if predicate.is_simple() {
            o != n
        } else {
            subtree_changes(o, n, &predicate.child_predicate())
        };
        if changed {
            return true;
        }
    }
    false
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct WatcherEntry {
    watcher: Arc<dyn StateWatcher>,
    enabled: bool,
    triggers: AtomicU64,
}

impl WatcherEntry {
    fn new(watcher: Arc<dyn StateWatcher>) -> Self {
        Self {
            watcher,
            enabled: true,
            triggers: AtomicU64::new(0),
        }
    }
}

/// Diagnostic summary of one registered watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatcherInfo {
    pub name: String,
    pub enabled: bool,
    pub triggers: u64,
}

/// The set of registered watchers.
#[derive(Default)]
pub struct WatcherRegistry {
    entries: Vec<WatcherEntry>,
}

impl WatcherRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every registered watcher. New watchers start enabled with a
    /// zero trigger count.
    pub fn set_watchers(&mut self, watchers: Vec<Arc<dyn StateWatcher>>) {
        self.entries = watchers.into_iter().map(WatcherEntry::new).collect();
    }

    /// Register one more watcher, replacing any watcher of the same name.
    pub fn register(&mut self, watcher: Arc<dyn StateWatcher>) {
        self.entries.retain(|e| e.watcher.name() != watcher.name());
        self.entries.push(WatcherEntry::new(watcher));
    }

    /// Returns true if a watcher of that name was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.watcher.name() != name);
        self.entries.len() != before
    }

    /// Returns true if a watcher of that name exists.
    pub fn enable(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Returns true if a watcher of that name exists.
    pub fn disable(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.entries.iter_mut().find(|e| e.watcher.name() == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Names of all registered watchers, in registration order.
    pub fn list(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.watcher.name().to_string())
            .collect()
    }

    /// Number of registered watchers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no watcher is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registered watchers currently enabled.
    pub fn enabled_count(&self) -> usize {
        self.entries.iter().filter(|e| e.enabled).count()
    }

    /// Name, enabled flag and trigger count of every watcher.
    pub fn info(&self) -> Vec<WatcherInfo> {
        self.entries
            .iter()
            .map(|e| WatcherInfo {
                name: e.watcher.name().to_string(),
                enabled: e.enabled,
                triggers: e.triggers.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Trigger every enabled watcher touched by `transition` and gather
    /// what they append. Returns `None` if nothing was appended.
    ///
    /// A watcher that fails or panics is logged; the others are still
    /// evaluated and whatever it appended before failing is kept.
    pub fn check_watchers(&self, root: &Composite, transition: &Transition) -> Option<StateUpdate> {
        let root_path = Path::root();
        let current = LiveView::new(root);
        let future = FutureView::new(root, transition);
        let mut output = StateUpdate::new();

        for entry in self.entries.iter().filter(|e| e.enabled) {
            let name = entry.watcher.name();
            let triggered = entry
                .watcher
                .predicates()
                .iter()
                .find(|p| predicate_has_been_triggered(Some(root), &root_path, p, transition));
            let Some(predicate) = triggered else {
                continue;
            };

            debug!(watcher = name, %predicate, "watcher triggered");
            entry.triggers.fetch_add(1, Ordering::Relaxed);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                entry.watcher.trigger(&mut output, &current, &future)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(watcher = name, error = %e, "watcher failed"),
                Err(payload) => {
                    error!(watcher = name, panic = panic_message(&*payload), "watcher panicked");
                }
            }
        }

        (!output.is_empty()).then_some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Mortality, Payload};
    use crate::metadata::MetadataRegistry;
    use crate::tree::BuildContext;
    use crate::visitor::ValueCollector;
    use std::time::{Duration, Instant};

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn pred(s: &str) -> Predicate {
        Predicate::parse(s).unwrap()
    }

    fn leaf(v: i64) -> Component {
        Component::value(v, Mortality::Ephemeral)
    }

    fn build(root: &Composite, update: StateUpdate) -> Transition {
        let registry = MetadataRegistry::new();
        update.build_transition(root, &BuildContext::new(Instant::now(), &registry))
    }

    fn tree(update: StateUpdate) -> Composite {
        let mut root = Composite::immortal();
        let t = build(&root, update);
        root.commit(t);
        root
    }

    fn triggered(root: &Composite, predicate: &str, t: &Transition) -> bool {
        predicate_has_been_triggered(Some(root), &Path::root(), &pred(predicate), t)
    }

    #[test]
    fn new_child_triggers() {
        let root = Composite::immortal();
        let t = build(&root, StateUpdate::new().with_update(p("doors.d1.load"), leaf(1)));

        assert!(triggered(&root, "doors.*.load", &t));
        assert!(triggered(&root, "doors.d1", &t));
        assert!(triggered(&root, "doors", &t));
        assert!(!triggered(&root, "doors.*.queue", &t));
        assert!(!triggered(&root, "pools.*.load", &t));
    }

    #[test]
    fn update_triggers_only_on_change() {
        let root = tree(StateUpdate::new().with_update(p("doors.d1.load"), leaf(1)));

        let same = build(&root, StateUpdate::new().with_update(p("doors.d1.load"), leaf(1)));
        assert!(!triggered(&root, "doors.*.load", &same));

        let changed = build(&root, StateUpdate::new().with_update(p("doors.d1.load"), leaf(2)));
        assert!(triggered(&root, "doors.*.load", &changed));
        // The branch itself was only traversed.
        assert!(!triggered(&root, "doors.d1", &changed));
    }

    #[test]
    fn removal_triggers() {
        let root = tree(
            StateUpdate::new()
                .with_update(p("pools.p1.space.free"), leaf(1))
                .with_update(p("pools.p2.space.free"), leaf(2)),
        );
        let t = build(&root, StateUpdate::new().with_purge(p("pools.p1")));

        assert!(triggered(&root, "pools.*", &t));
        assert!(triggered(&root, "pools.*.space.free", &t));
        assert!(!triggered(&root, "pools.*.space.used", &t));
        assert!(!triggered(&root, "pools.p2.space.free", &t));
    }

    #[test]
    fn expiry_triggers() {
        let now = Instant::now();
        let short = Component::value(1i64, Mortality::expiring_in(now, Duration::from_secs(1)));
        let root = tree(StateUpdate::new().with_update(p("a.b"), short));
        let t = crate::update::build_expiry_transition(&root, now + Duration::from_secs(60));
        assert!(triggered(&root, "a.b", &t));
    }

    #[test]
    fn untouched_children_never_trigger() {
        let root = tree(
            StateUpdate::new()
                .with_update(p("a.x"), leaf(1))
                .with_update(p("b.x"), leaf(1)),
        );
        let t = build(&root, StateUpdate::new().with_update(p("a.x"), leaf(5)));
        assert!(!triggered(&root, "b.x", &t));
        assert!(triggered(&root, "*.x", &t));
    }

    #[test]
    fn branch_with_children_triggers_deeper_predicates() {
        let root = tree(StateUpdate::new().with_update(p("pools.p1.free"), leaf(1)));

        let same = Composite::ephemeral().with_child("free", leaf(1)).unwrap();
        let t = build(&root, StateUpdate::new().with_update(p("pools.p1"), same.into()));
        assert!(!triggered(&root, "pools.*.free", &t));

        let changed = Composite::ephemeral().with_child("free", leaf(2)).unwrap();
        let t = build(&root, StateUpdate::new().with_update(p("pools.p1"), changed.into()));
        assert!(triggered(&root, "pools.*.free", &t));

        let fresh = Composite::ephemeral().with_child("free", leaf(3)).unwrap();
        let t = build(&root, StateUpdate::new().with_update(p("pools.p9"), fresh.into()));
        assert!(triggered(&root, "pools.*.free", &t));
    }

    #[test]
    fn leaf_replacing_branch_triggers_lost_descendants() {
        let root = tree(StateUpdate::new().with_update(p("x.y"), leaf(1)));
        let t = build(&root, StateUpdate::new().with_update(p("x"), leaf(1)));
        assert!(triggered(&root, "x.y", &t));
        assert!(triggered(&root, "x", &t));
    }

    #[test]
    fn check_watchers_collects_follow_up() {
        let root = Composite::immortal();
        let t = build(&root, StateUpdate::new().with_update(p("doors.d1.load"), leaf(7)));

        let mut registry = WatcherRegistry::new();
        registry.set_watchers(vec![Arc::new(FnWatcher::new(
            "load-copier",
            vec![pred("doors.*.load")],
            |update, current, future| {
                let before = ValueCollector::under(p("doors")).collect(current);
                let after = ValueCollector::under(p("doors")).collect(future);
                assert!(before.values().is_empty());
                if let Some(Payload::Integer(v)) = after.get(&p("doors.d1.load")) {
                    update.append_update(p("summary.load"), leaf(*v));
                }
                Ok(())
            },
        ))]);

        let follow_up = registry.check_watchers(&root, &t).unwrap();
        let upserts: Vec<_> = follow_up.upserts().collect();
        assert_eq!(upserts, vec![(&p("summary.load"), &leaf(7))]);
        assert_eq!(registry.info()[0].triggers, 1);
    }

    #[test]
    fn failing_watcher_does_not_stop_others() {
        let root = Composite::immortal();
        let t = build(&root, StateUpdate::new().with_update(p("a"), leaf(1)));

        let mut registry = WatcherRegistry::new();
        registry.set_watchers(vec![
            Arc::new(FnWatcher::new("broken", vec![pred("a")], |_, _, _| {
                anyhow::bail!("boom")
            })),
            Arc::new(FnWatcher::new("working", vec![pred("a")], |update, _, _| {
                update.append_update(p("b"), leaf(2));
                Ok(())
            })),
        ]);

        let follow_up = registry.check_watchers(&root, &t).unwrap();
        assert_eq!(follow_up.count(), 1);
        assert!(registry.info().iter().all(|i| i.triggers == 1));
    }

    #[test]
    fn panicking_watcher_does_not_stop_others() {
        let root = Composite::immortal();
        let t = build(&root, StateUpdate::new().with_update(p("a"), leaf(1)));

        let mut registry = WatcherRegistry::new();
        registry.set_watchers(vec![
            Arc::new(FnWatcher::new("panicky", vec![pred("a")], |_, _, _| {
                let empty: Vec<i64> = Vec::new();
                let _ = empty[0];
                Ok(())
            })),
            Arc::new(FnWatcher::new("working", vec![pred("a")], |update, _, _| {
                update.append_update(p("b"), leaf(2));
                Ok(())
            })),
        ]);

        let follow_up = registry.check_watchers(&root, &t).unwrap();
        assert_eq!(follow_up.count(), 1);
        assert!(registry.info().iter().all(|i| i.triggers == 1));
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("literal");
        let formatted: Box<dyn Any + Send> = Box::new(format!("code {}", 7));
        let other: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(&*literal), "literal");
        assert_eq!(panic_message(&*formatted), "code 7");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }

    #[test]
    fn disabled_watchers_are_skipped() {
        let root = Composite::immortal();
        let t = build(&root, StateUpdate::new().with_update(p("a"), leaf(1)));

        let mut registry = WatcherRegistry::new();
        registry.register(Arc::new(FnWatcher::new("w", vec![pred("a")], |update, _, _| {
            update.append_update(p("b"), leaf(2));
            Ok(())
        })));

        assert!(registry.disable("w"));
        assert_eq!(registry.enabled_count(), 0);
        assert!(registry.check_watchers(&root, &t).is_none());
        assert_eq!(registry.info()[0].triggers, 0);

        assert!(registry.enable("w"));
        assert!(registry.check_watchers(&root, &t).is_some());
        assert!(!registry.enable("missing"));
    }

    #[test]
    fn registration_management() {
        let noop = |name: &str| -> Arc<dyn StateWatcher> {
            Arc::new(FnWatcher::new(name, vec![pred("a")], |_, _, _| Ok(())))
        };
        let mut registry = WatcherRegistry::new();
        registry.set_watchers(vec![noop("one"), noop("two")]);
        assert_eq!(registry.list(), vec!["one", "two"]);

        registry.register(noop("one"));
        assert_eq!(registry.list(), vec!["two", "one"]);

        assert!(registry.unregister("two"));
        assert!(!registry.unregister("two"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn watcher_without_matching_predicate_is_not_triggered() {
        let root = Composite::immortal();
        let t = build(&root, StateUpdate::new().with_update(p("a"), leaf(1)));

        let mut registry = WatcherRegistry::new();
        registry.register(Arc::new(FnWatcher::new("w", vec![pred("b")], |_, _, _| {
            panic!("must not be called")
        })));
        assert!(registry.check_watchers(&root, &t).is_none());
    }
}
