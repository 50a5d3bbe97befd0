//! Tracing setup

use crate::error::{EnclaveError, EnclaveResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber: `RUST_LOG` if set, else `default_level`.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_level: &str) -> EnclaveResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| EnclaveError::Config(format!("tracing already initialized: {}", e)))
}
