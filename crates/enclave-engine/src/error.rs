//! Engine errors

use enclave_common::EnclaveError;
use thiserror::Error;

/// Text the engine reports when a requested subnet collides with an existing one
pub const POOL_OVERLAP_MESSAGE: &str = "Pool overlaps with other one on this address space";

/// Text the engine reports for an unknown container
pub const NO_SUCH_CONTAINER_MESSAGE: &str = "No such container";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{op} failed for '{target}': {message}")]
    Failed {
        op: &'static str,
        target: String,
        message: String,
    },

    #[error("could not run engine for {op}: {source}")]
    Spawn {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected engine output for {op}: {message}")]
    Unexpected { op: &'static str, message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
}

impl EngineError {
    pub fn failed(op: &'static str, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            op,
            target: target.into(),
            message: message.into(),
        }
    }

    /// True if the engine refused a network because its subnet is already in use
    pub fn is_pool_overlap(&self) -> bool {
        matches!(self, Self::Failed { message, .. } if message.contains(POOL_OVERLAP_MESSAGE))
    }

    /// True if the target object doesn't exist (anymore)
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Failed { message, .. } => message.contains(NO_SUCH_CONTAINER_MESSAGE),
            _ => false,
        }
    }
}

impl From<EngineError> for EnclaveError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Failed { op, target, message } => EnclaveError::Engine { op, target, message },
            EngineError::Spawn { op, source } => EnclaveError::engine(op, "engine", source),
            EngineError::Unexpected { op, message } => EnclaveError::engine(op, "engine", message),
            EngineError::NotFound { kind, id } => EnclaveError::NotFound(format!("{} '{}'", kind, id)),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
