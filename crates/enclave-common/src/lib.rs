//! enclave-net Common - Shared types for enclave provisioning and partitioning
//!
//! This crate provides the primitives every other enclave-net crate builds on:
//! - Identifiers (service IDs, GUIDs, partition IDs, partition connection IDs)
//! - Error taxonomy
//! - Engine label keys
//! - Configuration
//! - Tracing setup
//!
//! # Layering
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    enclave-provisioner                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                      enclave-network                         │
//! ├────────────────────┬───────────────────┬─────────────────────┤
//! │  enclave-topology  │  enclave-sidecar  │   enclave-engine    │
//! ├────────────────────┴───────────────────┴─────────────────────┤
//! │                 enclave-common (this crate)                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod labels;
pub mod telemetry;

pub use config::{NetworkConfig, ProvisionerConfig};
pub use error::*;
pub use ids::*;
