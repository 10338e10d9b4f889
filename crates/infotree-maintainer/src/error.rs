//! Maintainer error types.

use thiserror::Error;

/// Errors surfaced by the [`crate::StateStore`] handle.
#[derive(Debug, Error)]
pub enum MaintainerError {
    #[error("state store is shut down")]
    ShutDown,

    #[error("update queue is full")]
    QueueFull,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("state error: {0}")]
    State(#[from] infotree_state::StateError),
}

pub type MaintainerResult<T> = Result<T, MaintainerError>;
