//! enclave-net Provisioner - Enclave network, data volume and control plane
//!
//! [`EnclaveProvisioner`] turns an [`EnclaveRequest`] into a running enclave
//! and hands back an [`EnclaveHandle`]; [`EnclaveProvisioner::network_for`]
//! builds the service network that lives on it.

#![warn(clippy::all)]

pub mod names;
pub mod network_allocator;
pub mod provisioner;

pub use names::{EnclaveLabels, EnclaveObjectNames};
pub use network_allocator::{find_free_subnet, AllocatedNetwork, NetworkAllocator};
pub use provisioner::{ControlPlane, EnclaveHandle, EnclaveProvisioner, EnclaveRequest};
