//! Partition topology for enclave services
//!
//! Pure bookkeeping, no I/O: which partition each service lives in, how
//! partitions are connected, and the block lists that follow from both.

#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod topology;

pub use connection::{PacketDelayDistribution, PartitionConnection};
pub use error::{TopologyError, TopologyResult};
pub use topology::{Blocklists, PacketLossMap, PartitionTopology};
