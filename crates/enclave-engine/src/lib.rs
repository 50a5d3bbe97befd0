//! Container engine contract for enclave-net
//!
//! Everything above this crate talks to containers, networks and volumes
//! through [`ContainerEngine`]. Two backends ship here:
//!
//! - [`DockerCli`]: drives the `docker` binary with `tokio::process`
//! - `FakeEngine` (feature `testing`): in-memory engine with failure injection

#![warn(clippy::all)]

pub mod docker;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod types;

pub use docker::DockerCli;
pub use error::{EngineError, EngineResult};
#[cfg(any(test, feature = "testing"))]
pub use fake::FakeEngine;
pub use types::*;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Narrow view of a container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a bridge network and return its ID
    async fn create_network(
        &self,
        name: &str,
        subnet: Ipv4Network,
        gateway: Ipv4Addr,
        labels: &Labels,
    ) -> EngineResult<String>;

    /// IDs of networks whose name is exactly `name`
    async fn network_ids_by_name(&self, name: &str) -> EngineResult<Vec<String>>;

    /// IPv4 subnets of every network the engine knows
    async fn list_network_subnets(&self) -> EngineResult<Vec<Ipv4Network>>;

    async fn remove_network(&self, network_id: &str) -> EngineResult<()>;

    async fn create_volume(&self, name: &str, labels: &Labels) -> EngineResult<()>;

    /// Create and start a container, returning its ID and published host ports
    async fn create_and_start_container(
        &self,
        spec: &ContainerSpec,
    ) -> EngineResult<(String, HashMap<PortSpec, PortBinding>)>;

    /// Graceful stop; the engine kills the container once `timeout` elapses
    async fn stop_container(&self, container_id: &str, timeout: Duration) -> EngineResult<()>;

    async fn kill_container(&self, container_id: &str) -> EngineResult<()>;

    async fn remove_container(&self, container_id: &str) -> EngineResult<()>;

    /// Run `argv` inside a running container
    async fn run_exec_command(&self, container_id: &str, argv: &[String]) -> EngineResult<ExecOutput>;

    /// Tar archive of `src_path` inside the container
    async fn copy_from_container(&self, container_id: &str, src_path: &str) -> EngineResult<Vec<u8>>;

    /// Containers carrying every label in `labels`
    async fn containers_by_labels(
        &self,
        labels: &Labels,
        include_stopped: bool,
    ) -> EngineResult<Vec<ContainerInfo>>;
}
