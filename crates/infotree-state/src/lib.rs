//! infotree-state: the synchronous core of the infotree state store.
//!
//! A tree of named branches ([`Composite`]) whose leaves are typed values
//! ([`StateValue`]). Every node carries a [`Mortality`]: mortal nodes expire
//! at an instant, ephemeral nodes live until replaced, immortal nodes never
//! go away.
//!
//! # Architecture
//!
//! Changes never touch the live tree directly. A [`StateUpdate`] is first
//! translated into a [`Transition`], a map from branch path to
//! [`ChangeSet`]. Watchers inspect the pending transition through a
//! [`FutureView`] while the live tree is still visible through a
//! [`LiveView`]. Committing the transition is the only mutation.
//!
//! Time is always passed in explicitly as an [`std::time::Instant`], so the
//! tree itself has no clock and no background activity; see the
//! `infotree-maintainer` crate for the asynchronous store built on top.

pub mod component;
pub mod error;
pub mod metadata;
pub mod path;
pub mod predicate;
pub mod transition;
pub mod tree;
pub mod update;
pub mod visitor;
pub mod watcher;

pub use component::{Component, Composite, Mortality, Payload, StateValue};
pub use error::{StateError, StateResult};
pub use metadata::{BranchMetadata, MetadataRegistry};
pub use path::Path;
pub use predicate::Predicate;
pub use transition::{ChangeSet, Transition};
pub use tree::{BuildContext, DEFAULT_BRANCH_LIFETIME};
pub use update::{StateUpdate, build_expiry_transition};
pub use visitor::{FutureView, LiveView, StateExhibitor, StateVisitor, ValueCollector};
pub use watcher::{
    FnWatcher, StateWatcher, WatcherInfo, WatcherRegistry, predicate_has_been_triggered,
};
