//! Error types. Resource shortages and timeouts are not errors; they are
//! reported as `None` or short vectors and handled by the worker loop.

use std::io;

use thiserror::Error;

use crate::types::{RequestId, RequestState};

/// A lifecycle step that the request state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request {id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub id: RequestId,
    pub from: RequestState,
    pub to: RequestState,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("intake closed; request {0} refused")]
    IntakeClosed(RequestId),
    #[error("request {id} is {state}; only pending requests can be submitted")]
    NotPending { id: RequestId, state: RequestState },
    #[error("dispatch workers are already running")]
    AlreadyRunning,
    #[error("dispatch workers are not running")]
    NotRunning,
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("failed to spawn dispatch worker: {0}")]
    WorkerSpawn(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
