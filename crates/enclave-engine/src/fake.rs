//! In-memory engine for tests
//!
//! Records every exec and lets tests fail chosen operations.

use crate::error::{EngineError, EngineResult, POOL_OVERLAP_MESSAGE};
use crate::types::*;
use crate::ContainerEngine;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

type ExecHandler = Arc<dyn Fn(&str, &[String]) -> ExecOutput + Send + Sync>;

/// Operation names accepted by [`FakeEngine::fail`]
pub mod ops {
    pub const CREATE_NETWORK: &str = "create_network";
    pub const REMOVE_NETWORK: &str = "remove_network";
    pub const CREATE_VOLUME: &str = "create_volume";
    pub const START_CONTAINER: &str = "create_and_start_container";
    pub const STOP_CONTAINER: &str = "stop_container";
    pub const KILL_CONTAINER: &str = "kill_container";
    pub const REMOVE_CONTAINER: &str = "remove_container";
    pub const EXEC: &str = "run_exec_command";
    pub const COPY_FROM_CONTAINER: &str = "copy_from_container";
}

#[derive(Debug, Clone)]
pub struct FakeNetwork {
    pub id: String,
    pub name: String,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub labels: Labels,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub bindings: HashMap<PortSpec, PortBinding>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    next_host_port: u16,
    networks: HashMap<String, FakeNetwork>,
    external_subnets: Vec<Ipv4Network>,
    volumes: HashMap<String, Labels>,
    containers: HashMap<String, FakeContainer>,
    exec_log: Vec<(String, Vec<String>)>,
    /// op -> remaining failures (u32::MAX = forever)
    failures: HashMap<&'static str, u32>,
    pool_overlaps: u32,
    /// container name -> failure message
    exec_failures: HashMap<String, String>,
    exec_delay: Option<Duration>,
    /// (container id, path) -> archive bytes
    files: HashMap<(String, String), Vec<u8>>,
}

/// In-memory [`ContainerEngine`]
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
    exec_handler: Arc<Mutex<Option<ExecHandler>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op`
    pub fn fail(&self, op: &'static str, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    /// Fail every call of `op` until [`FakeEngine::clear_failures`]
    pub fn fail_always(&self, op: &'static str) {
        self.fail(op, u32::MAX);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.exec_failures.clear();
        state.pool_overlaps = 0;
    }

    /// Reject the next `times` network creations with the engine's pool overlap error
    pub fn overlap_pools(&self, times: u32) {
        self.state.lock().pool_overlaps = times;
    }

    /// Pretend a network outside our control already uses `subnet`
    pub fn occupy_subnet(&self, subnet: Ipv4Network) {
        self.state.lock().external_subnets.push(subnet);
    }

    /// Execs inside the container named `name` exit non-zero with `message`
    pub fn fail_exec_in(&self, name: impl Into<String>, message: impl Into<String>) {
        self.state.lock().exec_failures.insert(name.into(), message.into());
    }

    /// Answer execs with `handler` instead of a bare success
    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &[String]) -> ExecOutput + Send + Sync + 'static,
    {
        *self.exec_handler.lock() = Some(Arc::new(handler));
    }

    /// Make every exec sleep before answering
    pub fn set_exec_delay(&self, delay: Duration) {
        self.state.lock().exec_delay = Some(delay);
    }

    pub fn clear_exec_delay(&self) {
        self.state.lock().exec_delay = None;
    }

    /// Serve `archive` when `path` is copied out of `container_id`
    pub fn put_file(&self, container_id: &str, path: &str, archive: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .files
            .insert((container_id.to_string(), path.to_string()), archive.into());
    }

    /// Every exec so far as (container id, argv)
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().exec_log.clone()
    }

    pub fn clear_exec_log(&self) {
        self.state.lock().exec_log.clear();
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(id).cloned()
    }

    pub fn container_by_name(&self, name: &str) -> Option<FakeContainer> {
        self.state
            .lock()
            .containers
            .values()
            .find(|c| c.spec.name == name)
            .cloned()
    }

    pub fn running_containers(&self) -> Vec<FakeContainer> {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| c.running)
            .cloned()
            .collect()
    }

    pub fn networks(&self) -> Vec<FakeNetwork> {
        self.state.lock().networks.values().cloned().collect()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }

    fn check(&self, state: &mut FakeState, op: &'static str, target: &str) -> EngineResult<()> {
        match state.failures.get_mut(op) {
            Some(0) | None => Ok(()),
            Some(remaining) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                Err(EngineError::failed(op, target, "injected failure"))
            }
        }
    }

    fn new_id(state: &mut FakeState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}{:012x}", prefix, state.next_id)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_network(
        &self,
        name: &str,
        subnet: Ipv4Network,
        gateway: Ipv4Addr,
        labels: &Labels,
    ) -> EngineResult<String> {
        let mut state = self.state.lock();
        self.check(&mut state, ops::CREATE_NETWORK, name)?;
        if state.pool_overlaps > 0 {
            state.pool_overlaps -= 1;
            return Err(EngineError::failed(
                "create network",
                name,
                format!("Error response from daemon: {}", POOL_OVERLAP_MESSAGE),
            ));
        }
        let id = Self::new_id(&mut state, "net");
        state.networks.insert(
            id.clone(),
            FakeNetwork {
                id: id.clone(),
                name: name.to_string(),
                subnet,
                gateway,
                labels: labels.clone(),
            },
        );
        Ok(id)
    }

    async fn network_ids_by_name(&self, name: &str) -> EngineResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .networks
            .values()
            .filter(|n| n.name == name)
            .map(|n| n.id.clone())
            .collect())
    }

    async fn list_network_subnets(&self) -> EngineResult<Vec<Ipv4Network>> {
        let state = self.state.lock();
        let mut subnets: Vec<Ipv4Network> = state.networks.values().map(|n| n.subnet).collect();
        subnets.extend(state.external_subnets.iter().copied());
        Ok(subnets)
    }

    async fn remove_network(&self, network_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.check(&mut state, ops::REMOVE_NETWORK, network_id)?;
        state
            .networks
            .remove(network_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound { kind: "network", id: network_id.into() })
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.check(&mut state, ops::CREATE_VOLUME, name)?;
        state.volumes.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn create_and_start_container(
        &self,
        spec: &ContainerSpec,
    ) -> EngineResult<(String, HashMap<PortSpec, PortBinding>)> {
        let mut state = self.state.lock();
        self.check(&mut state, ops::START_CONTAINER, &spec.name)?;
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::failed(
                "start container",
                &spec.name,
                "container name already in use",
            ));
        }
        if let NetworkAttachment::Network { network_id, .. } = &spec.network {
            if !state.networks.contains_key(network_id) {
                return Err(EngineError::NotFound { kind: "network", id: network_id.clone() });
            }
        }

        let id = Self::new_id(&mut state, "ctr");
        let mut bindings = HashMap::new();
        if spec.publish_ports {
            for port in &spec.ports {
                state.next_host_port = state.next_host_port.max(32767) + 1;
                bindings.insert(
                    *port,
                    PortBinding { host_ip: "0.0.0.0".into(), host_port: state.next_host_port },
                );
            }
        }
        state.containers.insert(
            id.clone(),
            FakeContainer { id: id.clone(), spec: spec.clone(), running: true, bindings: bindings.clone() },
        );
        Ok((id, bindings))
    }

    async fn stop_container(&self, container_id: &str, _timeout: Duration) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.check(&mut state, ops::STOP_CONTAINER, container_id)?;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound { kind: "container", id: container_id.into() })?;
        container.running = false;
        Ok(())
    }

    async fn kill_container(&self, container_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.check(&mut state, ops::KILL_CONTAINER, container_id)?;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound { kind: "container", id: container_id.into() })?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.check(&mut state, ops::REMOVE_CONTAINER, container_id)?;
        state
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound { kind: "container", id: container_id.into() })
    }

    async fn run_exec_command(&self, container_id: &str, argv: &[String]) -> EngineResult<ExecOutput> {
        let (failure, delay) = {
            let mut state = self.state.lock();
            self.check(&mut state, ops::EXEC, container_id)?;
            let container = state
                .containers
                .get(container_id)
                .ok_or_else(|| EngineError::NotFound { kind: "container", id: container_id.into() })?;
            if !container.running {
                return Err(EngineError::failed("exec", container_id, "container is not running"));
            }
            let failure = state.exec_failures.get(&container.spec.name).cloned();
            state.exec_log.push((container_id.to_string(), argv.to_vec()));
            (failure, state.exec_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = failure {
            return Ok(ExecOutput { exit_code: 1, output: message });
        }
        let handler = self.exec_handler.lock().clone();
        Ok(match handler {
            Some(handler) => handler(container_id, argv),
            None => ExecOutput::success(""),
        })
    }

    async fn copy_from_container(&self, container_id: &str, src_path: &str) -> EngineResult<Vec<u8>> {
        let mut state = self.state.lock();
        self.check(&mut state, ops::COPY_FROM_CONTAINER, container_id)?;
        if !state.containers.contains_key(container_id) {
            return Err(EngineError::NotFound { kind: "container", id: container_id.into() });
        }
        state
            .files
            .get(&(container_id.to_string(), src_path.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::failed("copy from container", container_id, format!("no such path '{}'", src_path)))
    }

    async fn containers_by_labels(
        &self,
        labels: &Labels,
        include_stopped: bool,
    ) -> EngineResult<Vec<ContainerInfo>> {
        Ok(self
            .state
            .lock()
            .containers
            .values()
            .filter(|c| include_stopped || c.running)
            .filter(|c| labels.iter().all(|(k, v)| c.spec.labels.get(k) == Some(v)))
            .map(|c| ContainerInfo {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                labels: c.spec.labels.clone(),
                running: c.running,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, network_id: &str) -> ContainerSpec {
        ContainerSpec::new(
            name,
            "busybox",
            NetworkAttachment::Network { network_id: network_id.into(), ip_addr: None },
        )
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted() {
        let engine = FakeEngine::new();
        engine.fail(ops::CREATE_VOLUME, 1);

        assert!(engine.create_volume("v", &Labels::new()).await.is_err());
        assert!(engine.create_volume("v", &Labels::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_container_lifecycle_and_exec_log() {
        let engine = FakeEngine::new();
        let subnet: Ipv4Network = "10.4.0.0/20".parse().unwrap();
        let net = engine
            .create_network("enclave", subnet, Ipv4Addr::new(10, 4, 0, 1), &Labels::new())
            .await
            .unwrap();

        let mut s = spec("api", &net);
        s.ports.push(PortSpec::tcp(80));
        s.publish_ports = true;
        let (id, bindings) = engine.create_and_start_container(&s).await.unwrap();
        assert_eq!(bindings[&PortSpec::tcp(80)].host_port, 32768);

        let out = engine.run_exec_command(&id, &["true".to_string()]).await.unwrap();
        assert!(out.is_success());
        assert_eq!(engine.exec_log().len(), 1);

        engine.kill_container(&id).await.unwrap();
        assert!(engine.run_exec_command(&id, &[]).await.is_err());
        assert!(engine.running_containers().is_empty());
    }

    #[tokio::test]
    async fn test_copy_serves_stored_archives() {
        let engine = FakeEngine::new();
        let (id, _) = engine
            .create_and_start_container(&ContainerSpec::new("a", "busybox", NetworkAttachment::Container("x".into())))
            .await
            .unwrap();
        engine.put_file(&id, "/etc/hosts", b"archive".to_vec());

        assert_eq!(engine.copy_from_container(&id, "/etc/hosts").await.unwrap(), b"archive");
        assert!(engine.copy_from_container(&id, "/missing").await.is_err());
        assert!(matches!(
            engine.copy_from_container("nope", "/etc/hosts").await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_pool_overlap_then_success() {
        let engine = FakeEngine::new();
        engine.overlap_pools(1);
        let subnet: Ipv4Network = "10.4.0.0/20".parse().unwrap();
        let gw = Ipv4Addr::new(10, 4, 0, 1);

        let err = engine.create_network("e", subnet, gw, &Labels::new()).await.unwrap_err();
        assert!(err.is_pool_overlap());
        assert!(engine.create_network("e", subnet, gw, &Labels::new()).await.is_ok());
        assert_eq!(engine.network_ids_by_name("e").await.unwrap().len(), 1);
    }
}
