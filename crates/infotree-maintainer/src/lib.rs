//! infotree-maintainer: the asynchronous side of the infotree state store.
//!
//! Wraps the synchronous tree from `infotree-state` in a [`StateStore`]
//! handle that owns the tree behind a fair reader/writer lock, applies
//! producer updates from a bounded queue on a single worker task, evaluates
//! watchers before each commit and sweeps expired nodes on a timer.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use infotree_maintainer::{MaintainerConfig, StateStore};
//! use infotree_state::{Component, Mortality, Path, StateUpdate};
//!
//! let store = StateStore::start(&MaintainerConfig::default())?;
//! store.enqueue(StateUpdate::new().with_update(
//!     Path::parse("doors.d1.load")?,
//!     Component::value(0.42, Mortality::Ephemeral),
//! ))?;
//! store.flush().await?;
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod store;

pub use config::{MaintainerConfig, MetadataRule, parse_duration};
pub use diagnostics::Diagnostics;
pub use error::{MaintainerError, MaintainerResult};
pub use store::StateStore;
