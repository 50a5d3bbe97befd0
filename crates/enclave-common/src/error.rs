//! Error types for enclave-net

use thiserror::Error;

/// enclave-net error type
#[derive(Error, Debug)]
pub enum EnclaveError {
    /// Rejected input: blank or duplicate IDs, unknown partitions, bad repartitions
    #[error("validation failed: {0}")]
    Validation(String),

    /// Lookup of something that isn't registered
    #[error("not found: {0}")]
    NotFound(String),

    /// Subnet has no free address left
    #[error("no free IP address left in subnet {subnet}")]
    IpExhausted {
        /// Exhausted subnet in CIDR form
        subnet: String,
    },

    /// Operation attempted after the service network was destroyed
    #[error("the service network has been destroyed")]
    NetworkDestroyed,

    /// Repartition attempted on an enclave created without partitioning
    #[error("partitioning is not enabled for this enclave")]
    PartitioningDisabled,

    /// A container engine call failed
    #[error("{op} failed for '{target}': {message}")]
    Engine {
        /// Engine operation, e.g. "start container"
        op: &'static str,
        /// Container, network or volume the call targeted
        target: String,
        /// Engine-reported failure
        message: String,
    },

    /// Firewall rules inside a sidecar couldn't be applied
    #[error("firewall update failed for service '{service}': {message}")]
    Firewall {
        /// Service whose sidecar failed
        service: String,
        /// Failure detail
        message: String,
    },

    /// A primary failure whose compensating cleanup also failed
    #[error("{primary} (cleanup also failed: {})", .cleanup.join("; "))]
    Rollback {
        /// The error that triggered the rollback
        primary: Box<EnclaveError>,
        /// Cleanup failures; each one needs manual attention
        cleanup: Vec<String>,
    },

    /// Persisted state couldn't be read or written
    #[error("store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Broken internal bookkeeping
    #[error("internal consistency error: {0}")]
    Internal(String),
}

impl EnclaveError {
    /// Build an engine error from any displayable cause
    pub fn engine(op: &'static str, target: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Engine {
            op,
            target: target.into(),
            message: cause.to_string(),
        }
    }

    /// Attach cleanup failures to this error, if there were any
    pub fn with_cleanup(self, cleanup: Vec<String>) -> Self {
        if cleanup.is_empty() {
            self
        } else {
            Self::Rollback {
                primary: Box::new(self),
                cleanup,
            }
        }
    }

    /// True for the terminal destroyed-network error
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::NetworkDestroyed)
    }
}

/// Result type for enclave-net
pub type EnclaveResult<T> = Result<T, EnclaveError>;
