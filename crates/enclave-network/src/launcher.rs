//! Workload container launch and teardown

use enclave_common::labels::{
    CONTAINER_TYPE_LABEL, SERVICE_GUID_LABEL, SERVICE_ID_LABEL, USER_SERVICE_CONTAINER_TYPE,
};
use enclave_common::{EnclaveError, EnclaveResult, ServiceGuid, ServiceId};
use enclave_engine::{
    ContainerEngine, ContainerSpec, ExecOutput, Labels, NetworkAttachment, PortBinding, PortSpec,
};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fully resolved description of a service container
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub image: String,
    /// Port ID -> port inside the container
    pub ports: BTreeMap<String, PortSpec>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    /// Where the enclave data volume is mounted inside the container
    pub enclave_data_dir_mnt_dirpath: String,
    /// Expanded files-artifact volume name -> mount point
    pub files_artifact_mounts: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn new(image: impl Into<String>, enclave_data_dir_mnt_dirpath: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            enclave_data_dir_mnt_dirpath: enclave_data_dir_mnt_dirpath.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> EnclaveResult<()> {
        if self.image.trim().is_empty() {
            return Err(EnclaveError::Validation("service image cannot be empty".into()));
        }
        if !self.enclave_data_dir_mnt_dirpath.starts_with('/') {
            return Err(EnclaveError::Validation(format!(
                "enclave data dir mount path must be absolute, got '{}'",
                self.enclave_data_dir_mnt_dirpath
            )));
        }
        for mountpoint in self.files_artifact_mounts.values() {
            if *mountpoint == self.enclave_data_dir_mnt_dirpath {
                return Err(EnclaveError::Validation(format!(
                    "files artifact mount point '{}' collides with the enclave data dir mount",
                    mountpoint
                )));
            }
        }
        Ok(())
    }
}

/// A freshly started service container
#[derive(Debug, Clone)]
pub struct LaunchedService {
    pub container_id: String,
    /// Port ID -> host binding; empty unless ports are published
    pub host_port_bindings: HashMap<String, PortBinding>,
}

/// Starts and stops service containers on the enclave network
pub struct ServiceLauncher {
    engine: Arc<dyn ContainerEngine>,
    network_id: String,
    data_volume: String,
    name_prefix: String,
    labels: Labels,
    publish_ports: bool,
}

impl ServiceLauncher {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        network_id: impl Into<String>,
        data_volume: impl Into<String>,
        name_prefix: impl Into<String>,
        labels: Labels,
        publish_ports: bool,
    ) -> Self {
        Self {
            engine,
            network_id: network_id.into(),
            data_volume: data_volume.into(),
            name_prefix: name_prefix.into(),
            labels,
            publish_ports,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub async fn launch(
        &self,
        service_id: &ServiceId,
        guid: &ServiceGuid,
        ip_addr: Ipv4Addr,
        config: &ServiceConfig,
    ) -> EnclaveResult<LaunchedService> {
        config.validate()?;
        let spec = self.container_spec(service_id, guid, ip_addr, config);

        let (container_id, bindings) = self.engine.create_and_start_container(&spec).await?;
        let host_port_bindings = config
            .ports
            .iter()
            .filter_map(|(port_id, port)| bindings.get(port).map(|b| (port_id.clone(), b.clone())))
            .collect();

        info!(
            service = %service_id,
            container = %container_id,
            ip = %ip_addr,
            image = %config.image,
            "Started service container"
        );
        Ok(LaunchedService { container_id, host_port_bindings })
    }

    /// Graceful stop; falls back to a kill when the stop itself fails
    pub async fn stop(&self, container_id: &str, timeout: Duration) -> EnclaveResult<()> {
        if let Err(e) = self.engine.stop_container(container_id, timeout).await {
            warn!(container = %container_id, error = %e, "Graceful stop failed, killing container");
            self.engine.kill_container(container_id).await?;
        }
        debug!(container = %container_id, "Stopped service container");
        Ok(())
    }

    pub async fn exec(&self, container_id: &str, argv: &[String]) -> EnclaveResult<ExecOutput> {
        if argv.is_empty() {
            return Err(EnclaveError::Validation("exec command cannot be empty".into()));
        }
        Ok(self.engine.run_exec_command(container_id, argv).await?)
    }

    /// Tar archive of `src_path` inside a service container
    pub async fn copy_from(&self, container_id: &str, src_path: &str) -> EnclaveResult<Vec<u8>> {
        if src_path.trim().is_empty() {
            return Err(EnclaveError::Validation("copy source path cannot be empty".into()));
        }
        Ok(self.engine.copy_from_container(container_id, src_path).await?)
    }

    fn container_spec(
        &self,
        service_id: &ServiceId,
        guid: &ServiceGuid,
        ip_addr: Ipv4Addr,
        config: &ServiceConfig,
    ) -> ContainerSpec {
        let mut spec = ContainerSpec::new(
            format!("{}--user-service--{}", self.name_prefix, guid),
            config.image.clone(),
            NetworkAttachment::Network {
                network_id: self.network_id.clone(),
                ip_addr: Some(ip_addr),
            },
        );
        spec.labels = self.labels.clone();
        spec.labels.insert(CONTAINER_TYPE_LABEL.into(), USER_SERVICE_CONTAINER_TYPE.into());
        spec.labels.insert(SERVICE_ID_LABEL.into(), service_id.to_string());
        spec.labels.insert(SERVICE_GUID_LABEL.into(), guid.to_string());
        spec.env = config.env.clone();
        spec.entrypoint = config.entrypoint.clone();
        spec.cmd = config.cmd.clone();
        spec.ports = config.ports.values().copied().collect();
        spec.publish_ports = self.publish_ports;
        spec.volume_mounts = config.files_artifact_mounts.clone();
        spec.volume_mounts
            .insert(self.data_volume.clone(), config.enclave_data_dir_mnt_dirpath.clone());
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_engine::fake::ops;
    use enclave_engine::FakeEngine;

    async fn launcher(engine: &FakeEngine, publish_ports: bool) -> ServiceLauncher {
        let network_id = engine
            .create_network(
                "enclave",
                "10.8.0.0/20".parse().unwrap(),
                Ipv4Addr::new(10, 8, 0, 1),
                &Labels::new(),
            )
            .await
            .unwrap();
        ServiceLauncher::new(
            Arc::new(engine.clone()),
            network_id,
            "enclave-data",
            "enclave",
            Labels::from([("enclave.id".to_string(), "enclave".to_string())]),
            publish_ports,
        )
    }

    #[tokio::test]
    async fn test_launch_builds_container() {
        let engine = FakeEngine::new();
        let launcher = launcher(&engine, true).await;
        let id = ServiceId::new("api");
        let guid = ServiceGuid::generate(&id);

        let mut config = ServiceConfig::new("nginx:1.25", "/data");
        config.ports.insert("http".into(), PortSpec::tcp(80));
        config.files_artifact_mounts.insert("artifact-vol".into(), "/static".into());

        let launched = launcher
            .launch(&id, &guid, Ipv4Addr::new(10, 8, 0, 3), &config)
            .await
            .unwrap();
        assert!(launched.host_port_bindings.contains_key("http"));

        let container = engine.container(&launched.container_id).unwrap();
        assert_eq!(container.spec.static_ip(), Some(Ipv4Addr::new(10, 8, 0, 3)));
        assert_eq!(container.spec.volume_mounts.get("enclave-data").map(String::as_str), Some("/data"));
        assert_eq!(container.spec.volume_mounts.get("artifact-vol").map(String::as_str), Some("/static"));
        assert_eq!(container.spec.labels.get(SERVICE_ID_LABEL).map(String::as_str), Some("api"));
    }

    #[tokio::test]
    async fn test_unpublished_ports_have_no_bindings() {
        let engine = FakeEngine::new();
        let launcher = launcher(&engine, false).await;
        let id = ServiceId::new("api");
        let mut config = ServiceConfig::new("nginx:1.25", "/data");
        config.ports.insert("http".into(), PortSpec::tcp(80));

        let launched = launcher
            .launch(&id, &ServiceGuid::generate(&id), Ipv4Addr::new(10, 8, 0, 3), &config)
            .await
            .unwrap();
        assert!(launched.host_port_bindings.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_config() {
        let engine = FakeEngine::new();
        let launcher = launcher(&engine, false).await;
        let id = ServiceId::new("api");
        let guid = ServiceGuid::generate(&id);
        let ip = Ipv4Addr::new(10, 8, 0, 3);

        assert!(launcher.launch(&id, &guid, ip, &ServiceConfig::new("", "/data")).await.is_err());
        assert!(launcher.launch(&id, &guid, ip, &ServiceConfig::new("nginx", "data")).await.is_err());
        assert!(engine.running_containers().is_empty());
    }

    #[tokio::test]
    async fn test_stop_falls_back_to_kill() {
        let engine = FakeEngine::new();
        let launcher = launcher(&engine, false).await;
        let id = ServiceId::new("api");
        let launched = launcher
            .launch(&id, &ServiceGuid::generate(&id), Ipv4Addr::new(10, 8, 0, 3), &ServiceConfig::new("nginx", "/data"))
            .await
            .unwrap();

        engine.fail(ops::STOP_CONTAINER, 1);
        launcher.stop(&launched.container_id, Duration::from_secs(1)).await.unwrap();
        assert!(!engine.container(&launched.container_id).unwrap().running);
    }
}
