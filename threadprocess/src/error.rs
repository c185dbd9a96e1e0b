//! Errors surfaced to the caller of a [`Controller`](crate::Controller).
//!
//! Failures inside the worker's hooks never show up here: they are logged
//! where they happen and turned into `success = false` responses or state
//! transitions. What remains are problems the caller can act on.

use std::{io, time::Duration};

use crate::{channel::error::RecvError, state::WorkerState};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected before any worker was spawned.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The startup hook failed. Only returned when startup is strict.
    #[error("worker failed to start: {message}")]
    Startup { message: String },

    /// A bounded wait for a response expired. The worker is unaffected and
    /// the response, if it arrives later, stays retrievable.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The worker has finished and no matching response is left.
    #[error("response channel closed")]
    Closed,

    /// The worker no longer takes requests (startup failure or already quit).
    #[error("worker is not accepting requests (state: {0})")]
    Unavailable(WorkerState),

    /// A quit was already submitted through this controller.
    #[error("controller is shutting down")]
    ShuttingDown,

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("wire codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<RecvError> for Error {
    fn from(err: RecvError) -> Self {
        match err {
            RecvError::Timeout(limit) => Error::Timeout(limit),
            RecvError::Closed => Error::Closed,
        }
    }
}

impl Error {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "invalid_configuration",
            Error::Startup { .. } => "startup_error",
            Error::Timeout(_) => "timeout",
            Error::Closed => "closed",
            Error::Unavailable(_) => "unavailable",
            Error::ShuttingDown => "shutting_down",
            Error::Spawn(_) => "spawn",
            Error::Io(_) => "io",
            Error::Codec(_) => "codec",
        }
    }
}
