//! Firewall sidecars for partitioned enclave services
//!
//! Each started service in a partitioned enclave gets a sidecar container
//! sharing its network namespace. The sidecar owns two iptables chains and
//! swaps between them so a service's rules are never half-written.

#![warn(clippy::all)]

pub mod firewall;
pub mod registry;

pub use firewall::{ActiveChain, Chain, FirewallEnforcer, IptablesEnforcer};
pub use registry::SidecarRegistry;
