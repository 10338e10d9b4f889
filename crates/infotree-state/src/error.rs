//! Error types for the infotree state tree.

use thiserror::Error;

use crate::path::Path;

/// Result type alias for state tree operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised while turning a single upsert or purge into a transition.
///
/// None of these are fatal: the update engine logs the failing entry and
/// carries on with the rest of the update.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("bad path: {0}")]
    BadPath(String),

    #[error("not a branch: {0}")]
    NotABranch(Path),

    #[error("no such path: {0}")]
    NoSuchPath(Path),
}
