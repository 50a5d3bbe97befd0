//! enclave-net Network - Service lifecycle inside one enclave
//!
//! [`ServiceNetwork`] is the aggregate root. It owns the IP allocator, the
//! partition topology, the sidecar registry and the service launcher, and
//! serializes every operation behind one async mutex.

#![warn(clippy::all)]

pub mod cleanup;
pub mod data_dir;
pub mod ip_allocator;
pub mod launcher;
pub mod service_network;
pub mod store;

pub use data_dir::{EnclaveDataDir, ServiceDirectory};
pub use ip_allocator::IpAllocator;
pub use launcher::{ServiceConfig, ServiceLauncher};
pub use service_network::{NetworkBinding, ServiceNetwork, ServiceRegistrationInfo, ServiceRunInfo};
pub use store::{IpReservationStore, JsonFileStore, MemoryStore};
