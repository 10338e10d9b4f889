//! Tree nodes: leaf values and branch composites, and their mortality.
//!
//! Every node is a [`Component`]: either a [`StateValue`] leaf or a
//! [`Composite`] branch. Every node has a [`Mortality`]:
//!
//! - `Mortal(at)` expires at `at`. A mortal branch never expires before a
//!   mortal child it holds; adding a longer-lived child extends the branch.
//! - `Ephemeral` never expires by itself and does not extend its parent.
//! - `Immortal` never expires, and makes every ancestor branch immortal
//!   too. A branch that became immortal stays immortal.
//!
//! Branches cache the earliest expiry instant of any mortal descendant so a
//! sweep can skip subtrees with nothing due.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{StateError, StateResult};
use crate::metadata::BranchMetadata;
use crate::path::Path;

/// Expiry classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mortality {
    Mortal(Instant),
    Ephemeral,
    Immortal,
}

impl Mortality {
    /// Mortal, expiring `lifetime` after `now`. A lifetime too long to
    /// represent is never reached, so the node is ephemeral instead.
    pub fn expiring_in(now: Instant, lifetime: Duration) -> Self {
        match now.checked_add(lifetime) {
            Some(at) => Mortality::Mortal(at),
            None => Mortality::Ephemeral,
        }
    }

    /// The expiry instant, for mortal nodes only.
    pub fn expiry(&self) -> Option<Instant> {
        match self {
            Mortality::Mortal(at) => Some(*at),
            Mortality::Ephemeral | Mortality::Immortal => None,
        }
    }

    /// Whether this node has an expiry instant.
    pub fn is_mortal(&self) -> bool {
        matches!(self, Mortality::Mortal(_))
    }

    /// Whether this node lives until replaced or removed.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Mortality::Ephemeral)
    }

    /// Whether this node never expires.
    pub fn is_immortal(&self) -> bool {
        matches!(self, Mortality::Immortal)
    }

    /// Only mortal nodes expire, and only once `now` reaches their instant.
    pub fn has_expired(&self, now: Instant) -> bool {
        match self {
            Mortality::Mortal(at) => now >= *at,
            Mortality::Ephemeral | Mortality::Immortal => false,
        }
    }
}

/// The payload of a leaf.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Boolean(bool),
    Integer(i64),
    String(String),
    Float(f64),
}

impl Payload {
    /// Short name of the payload kind, as used in serialized form.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Boolean(_) => "boolean",
            Payload::Integer(_) => "integer",
            Payload::String(_) => "string",
            Payload::Float(_) => "float",
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Boolean(v) => write!(f, "{v}"),
            Payload::Integer(v) => write!(f, "{v}"),
            Payload::String(v) => write!(f, "\"{v}\""),
            Payload::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Payload::Boolean(v)
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Payload::Integer(v)
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Payload::Float(v)
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Payload::String(v)
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Payload::String(v.to_string())
    }
}

/// A leaf node.
///
/// Two values are equal when their payloads are equal; mortality is not
/// compared, so re-publishing a reading with a fresh expiry is not a change.
#[derive(Debug, Clone)]
pub struct StateValue {
    payload: Payload,
    mortality: Mortality,
}

impl StateValue {
    /// Create a leaf holding `payload`.
    pub fn new(payload: impl Into<Payload>, mortality: Mortality) -> Self {
        Self {
            payload: payload.into(),
            mortality,
        }
    }

    /// The leaf's payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The leaf's expiry classification.
    pub fn mortality(&self) -> Mortality {
        self.mortality
    }
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
    }
}

/// A branch node holding named children.
#[derive(Debug, Clone)]
pub struct Composite {
    children: BTreeMap<String, Component>,
    mortality: Mortality,
    earliest_descendant_expiry: Option<Instant>,
    metadata: Option<Arc<BranchMetadata>>,
}

impl Composite {
    /// An empty branch with the given mortality.
    pub fn new(mortality: Mortality) -> Self {
        Self {
            children: BTreeMap::new(),
            mortality,
            earliest_descendant_expiry: None,
            metadata: None,
        }
    }

    /// An empty branch expiring `lifetime` after `now`.
    pub fn mortal(now: Instant, lifetime: Duration) -> Self {
        Self::new(Mortality::expiring_in(now, lifetime))
    }

    /// An empty branch that lives until removed.
    pub fn ephemeral() -> Self {
        Self::new(Mortality::Ephemeral)
    }

    /// An empty branch that never expires.
    pub fn immortal() -> Self {
        Self::new(Mortality::Immortal)
    }

    /// Builder form of [`Composite::insert_child`].
    pub fn with_child(mut self, label: &str, child: impl Into<Component>) -> StateResult<Self> {
        self.insert_child(label, child.into())?;
        Ok(self)
    }

    /// Add or replace a child directly, keeping the mortality invariants.
    ///
    /// This is for assembling a detached branch that will later be submitted
    /// in an update; the live tree only changes through transitions.
    pub fn insert_child(&mut self, label: &str, child: Component) -> StateResult<()> {
        if label.is_empty() || label.contains(crate::path::SEPARATOR) {
            return Err(StateError::BadPath(format!("invalid child label \"{label}\"")));
        }
        self.absorb_child_mortality(child.mortality());
        self.children.insert(label.to_string(), child);
        self.recalc_earliest_descendant_expiry();
        Ok(())
    }

    /// The direct child named `label`.
    pub fn child(&self, label: &str) -> Option<&Component> {
        self.children.get(label)
    }

    /// Whether a direct child named `label` exists.
    pub fn contains_child(&self, label: &str) -> bool {
        self.children.contains_key(label)
    }

    /// Children in label order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Component)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether this branch has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// The branch's own expiry classification.
    pub fn mortality(&self) -> Mortality {
        self.mortality
    }

    /// The earliest expiry of any mortal descendant, if there is one.
    pub fn earliest_descendant_expiry(&self) -> Option<Instant> {
        self.earliest_descendant_expiry
    }

    /// Attributes attached to this branch, if any.
    pub fn metadata(&self) -> Option<&BranchMetadata> {
        self.metadata.as_deref()
    }

    /// Attach (or clear) this branch's attributes.
    pub fn set_metadata(&mut self, metadata: Option<Arc<BranchMetadata>>) {
        self.metadata = metadata;
    }

    /// Find the node at `path` relative to this branch.
    pub fn lookup(&self, path: &Path) -> Option<&Component> {
        let mut labels = path.labels();
        let first = labels.next()?;
        let mut current = self.children.get(first)?;
        for label in labels {
            current = current.as_composite()?.children.get(label)?;
        }
        Some(current)
    }

    pub(crate) fn children_map(&self) -> &BTreeMap<String, Component> {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeMap<String, Component> {
        &mut self.children
    }

    /// Apply a child's mortality to this branch: extend a mortal branch to
    /// outlive a mortal child, and turn the branch immortal for an immortal
    /// child.
    fn absorb_child_mortality(&mut self, child: Mortality) {
        match child {
            Mortality::Mortal(at) => self.extend_expiry(at),
            Mortality::Immortal => self.become_immortal(),
            Mortality::Ephemeral => {}
        }
    }

    /// Push a mortal branch's expiry later. Earlier instants are ignored and
    /// non-mortal branches are unaffected.
    pub(crate) fn extend_expiry(&mut self, at: Instant) {
        if let Mortality::Mortal(current) = self.mortality {
            if at > current {
                self.mortality = Mortality::Mortal(at);
            }
        }
    }

    pub(crate) fn become_immortal(&mut self) {
        self.mortality = Mortality::Immortal;
    }

    pub(crate) fn recalc_earliest_descendant_expiry(&mut self) {
        self.earliest_descendant_expiry = self
            .children
            .values()
            .flat_map(|child| [child.earliest_descendant_expiry(), child.mortality().expiry()])
            .flatten()
            .min();
    }

    /// Fold an existing branch that this one is replacing into it: carry
    /// over children this branch does not name, the later expiry, and
    /// immortality.
    pub(crate) fn merge_replaced(&mut self, existing: Composite) {
        for (label, child) in existing.children {
            self.children.entry(label).or_insert(child);
        }
        match existing.mortality {
            Mortality::Mortal(at) => self.extend_expiry(at),
            Mortality::Immortal => self.become_immortal(),
            Mortality::Ephemeral => {}
        }
        if self.metadata.is_none() {
            self.metadata = existing.metadata;
        }
        self.recalc_earliest_descendant_expiry();
    }
}

impl PartialEq for Composite {
    fn eq(&self, other: &Self) -> bool {
        self.children == other.children
    }
}

/// A node of the state tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Value(StateValue),
    Composite(Composite),
}

impl Component {
    /// Convenience constructor for a leaf.
    pub fn value(payload: impl Into<Payload>, mortality: Mortality) -> Self {
        Component::Value(StateValue::new(payload, mortality))
    }

    /// The node's own expiry classification.
    pub fn mortality(&self) -> Mortality {
        match self {
            Component::Value(v) => v.mortality,
            Component::Composite(c) => c.mortality,
        }
    }

    /// Whether the node itself is mortal and past its expiry at `now`.
    pub fn has_expired(&self, now: Instant) -> bool {
        self.mortality().has_expired(now)
    }

    /// Leaves have no descendants, so never carry a descendant expiry.
    pub fn earliest_descendant_expiry(&self) -> Option<Instant> {
        match self {
            Component::Value(_) => None,
            Component::Composite(c) => c.earliest_descendant_expiry,
        }
    }

    /// The branch, if this node is one.
    pub fn as_composite(&self) -> Option<&Composite> {
        match self {
            Component::Composite(c) => Some(c),
            Component::Value(_) => None,
        }
    }

    /// The leaf, if this node is one.
    pub fn as_value(&self) -> Option<&StateValue> {
        match self {
            Component::Value(v) => Some(v),
            Component::Composite(_) => None,
        }
    }

    /// Whether this node is a branch.
    pub fn is_composite(&self) -> bool {
        matches!(self, Component::Composite(_))
    }
}

impl From<StateValue> for Component {
    fn from(v: StateValue) -> Self {
        Component::Value(v)
    }
}

impl From<Composite> for Component {
    fn from(c: Composite) -> Self {
        Component::Composite(c)
    }
}
