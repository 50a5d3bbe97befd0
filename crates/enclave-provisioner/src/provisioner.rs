//! Enclave creation and teardown
//!
//! Creating an enclave is a short saga: network, data volume, control plane,
//! availability wait. Completed steps are compensated in reverse when a later
//! one fails.

use crate::names::{EnclaveLabels, EnclaveObjectNames};
use crate::network_allocator::NetworkAllocator;
use chrono::{DateTime, Utc};
use enclave_common::{EnclaveError, EnclaveResult, NetworkConfig, ProvisionerConfig};
use enclave_engine::{ContainerEngine, ContainerSpec, NetworkAttachment, PortBinding, PortSpec};
use enclave_network::{
    EnclaveDataDir, IpAllocator, IpReservationStore, MemoryStore, NetworkBinding, ServiceNetwork,
};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const ENCLAVE_ID_ENV: &str = "ENCLAVE_ID";
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
pub const OWN_IP_ADDRESS_ENV: &str = "OWN_IP_ADDRESS";
pub const LISTEN_PORT_ENV: &str = "LISTEN_PORT";
pub const PARTITIONING_ENABLED_ENV: &str = "PARTITIONING_ENABLED";
pub const ENCLAVE_DATA_DIRPATH_ENV: &str = "ENCLAVE_DATA_DIRPATH";

const RESERVED_ENV: &[&str] = &[
    ENCLAVE_ID_ENV,
    LOG_LEVEL_ENV,
    OWN_IP_ADDRESS_ENV,
    LISTEN_PORT_ENV,
    PARTITIONING_ENABLED_ENV,
    ENCLAVE_DATA_DIRPATH_ENV,
];

/// What the caller wants from a new enclave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveRequest {
    pub enclave_id: String,
    pub control_plane_image: String,
    pub log_level: String,
    pub partitioning_enabled: bool,
    pub publish_ports: bool,
    /// Extra control-plane environment; may not shadow the built-in variables
    #[serde(default)]
    pub control_plane_env: BTreeMap<String, String>,
}

impl EnclaveRequest {
    pub fn new(enclave_id: impl Into<String>, control_plane_image: impl Into<String>) -> Self {
        Self {
            enclave_id: enclave_id.into(),
            control_plane_image: control_plane_image.into(),
            log_level: "info".into(),
            partitioning_enabled: false,
            publish_ports: false,
            control_plane_env: BTreeMap::new(),
        }
    }

    fn validate(&self) -> EnclaveResult<()> {
        if self.enclave_id.trim().is_empty() {
            return Err(EnclaveError::Validation("enclave ID cannot be empty or whitespace".into()));
        }
        if self.control_plane_image.trim().is_empty() {
            return Err(EnclaveError::Validation("control plane image cannot be empty".into()));
        }
        if let Some(key) = self.control_plane_env.keys().find(|k| RESERVED_ENV.contains(&k.as_str())) {
            return Err(EnclaveError::Validation(format!(
                "control plane environment variable '{}' conflicts with a built-in one",
                key
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ControlPlane {
    pub container_id: String,
    pub ip_addr: Ipv4Addr,
    /// Set when ports are published
    pub host_binding: Option<PortBinding>,
}

/// A live enclave
#[derive(Debug, Clone)]
pub struct EnclaveHandle {
    pub enclave_id: String,
    pub network_id: String,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub data_volume: String,
    pub control_plane: ControlPlane,
    pub names: EnclaveObjectNames,
    pub labels: EnclaveLabels,
    pub partitioning_enabled: bool,
    pub publish_ports: bool,
    pub created_at: DateTime<Utc>,
}

/// Completed steps that must be undone if a later one fails
enum Compensation {
    RemoveNetwork(String),
    RemoveContainer(String),
}

/// Creates and destroys enclaves on a container engine
pub struct EnclaveProvisioner {
    engine: Arc<dyn ContainerEngine>,
    config: ProvisionerConfig,
    network_config: NetworkConfig,
}

impl EnclaveProvisioner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: ProvisionerConfig,
        network_config: NetworkConfig,
    ) -> EnclaveResult<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            network_config,
        })
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Create the network, data volume and control plane of a new enclave
    pub async fn create_enclave(&self, request: EnclaveRequest) -> EnclaveResult<EnclaveHandle> {
        request.validate()?;
        let names = EnclaveObjectNames::new(request.enclave_id.as_str());
        let labels = EnclaveLabels::new(request.enclave_id.as_str());

        let existing = self.engine.network_ids_by_name(&names.network_name()).await?;
        if !existing.is_empty() {
            return Err(EnclaveError::Validation(format!(
                "enclave '{}' already exists (network IDs: {})",
                request.enclave_id,
                existing.join(", ")
            )));
        }

        let mut compensations = Vec::new();
        match self.provision(&request, names, labels, &mut compensations).await {
            Ok(handle) => {
                info!(
                    enclave = %handle.enclave_id,
                    subnet = %handle.subnet,
                    control_plane = %handle.control_plane.ip_addr,
                    "Enclave created"
                );
                Ok(handle)
            }
            Err(e) => {
                warn!(enclave = %request.enclave_id, error = %e, "Enclave creation failed, rolling back");
                let failures = self.compensate(compensations).await;
                Err(e.with_cleanup(failures))
            }
        }
    }

    async fn provision(
        &self,
        request: &EnclaveRequest,
        names: EnclaveObjectNames,
        labels: EnclaveLabels,
        compensations: &mut Vec<Compensation>,
    ) -> EnclaveResult<EnclaveHandle> {
        let allocator = NetworkAllocator::new(
            self.config.subnet_width_bits,
            self.config.network_create_retries,
            self.config.network_create_retry_delay(),
        );
        let network = allocator
            .create_network(self.engine.as_ref(), &names.network_name(), &labels.base())
            .await?;
        compensations.push(Compensation::RemoveNetwork(network.network_id.clone()));

        let data_volume = names.data_volume_name();
        self.engine.create_volume(&data_volume, &labels.base()).await?;

        let ips = IpAllocator::new(network.subnet, Arc::new(MemoryStore::new()));
        ips.reserve(network.gateway)?;
        let control_plane_ip = ips.allocate()?;

        let spec = self.control_plane_spec(
            request,
            &names,
            &labels,
            &network.network_id,
            &data_volume,
            control_plane_ip,
        );
        let (container_id, bindings) = self.engine.create_and_start_container(&spec).await?;
        compensations.push(Compensation::RemoveContainer(container_id.clone()));
        info!(enclave = %request.enclave_id, container = %container_id, ip = %control_plane_ip, "Started control plane");

        self.wait_for_availability(&container_id).await?;

        Ok(EnclaveHandle {
            enclave_id: request.enclave_id.clone(),
            network_id: network.network_id,
            subnet: network.subnet,
            gateway: network.gateway,
            data_volume,
            control_plane: ControlPlane {
                container_id,
                ip_addr: control_plane_ip,
                host_binding: bindings.get(&PortSpec::tcp(self.config.control_plane_listen_port)).cloned(),
            },
            names,
            labels,
            partitioning_enabled: request.partitioning_enabled,
            publish_ports: request.publish_ports,
            created_at: Utc::now(),
        })
    }

    fn control_plane_spec(
        &self,
        request: &EnclaveRequest,
        names: &EnclaveObjectNames,
        labels: &EnclaveLabels,
        network_id: &str,
        data_volume: &str,
        ip_addr: Ipv4Addr,
    ) -> ContainerSpec {
        let port = self.config.control_plane_listen_port;
        let mut spec = ContainerSpec::new(
            names.control_plane_container_name(),
            request.control_plane_image.clone(),
            NetworkAttachment::Network {
                network_id: network_id.to_string(),
                ip_addr: Some(ip_addr),
            },
        );
        spec.labels = labels.control_plane();
        spec.env = request.control_plane_env.clone();
        spec.env.insert(ENCLAVE_ID_ENV.into(), request.enclave_id.clone());
        spec.env.insert(LOG_LEVEL_ENV.into(), request.log_level.clone());
        spec.env.insert(OWN_IP_ADDRESS_ENV.into(), ip_addr.to_string());
        spec.env.insert(LISTEN_PORT_ENV.into(), port.to_string());
        spec.env.insert(PARTITIONING_ENABLED_ENV.into(), request.partitioning_enabled.to_string());
        spec.env.insert(
            ENCLAVE_DATA_DIRPATH_ENV.into(),
            self.config.enclave_data_mount_dirpath.clone(),
        );
        spec.ports = vec![PortSpec::tcp(port)];
        spec.publish_ports = request.publish_ports;
        spec.volume_mounts
            .insert(data_volume.to_string(), self.config.enclave_data_mount_dirpath.clone());
        spec
    }

    /// Poll until the control plane listens on its port
    async fn wait_for_availability(&self, container_id: &str) -> EnclaveResult<()> {
        let port = self.config.control_plane_listen_port;
        let probe = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("[ -n \"$(netstat -anp tcp | grep LISTEN | grep {})\" ]", port),
        ];
        let attempts = self.config.availability_retries;
        let mut last_failure = String::new();

        for attempt in 1..=attempts {
            match self.engine.run_exec_command(container_id, &probe).await {
                Ok(out) if out.is_success() => {
                    debug!(container = %container_id, attempt, "Control plane is listening");
                    return Ok(());
                }
                Ok(out) => {
                    last_failure = format!("probe exited {}: {}", out.exit_code, out.output.trim());
                }
                Err(e) => last_failure = e.to_string(),
            }
            debug!(container = %container_id, attempt, "Control plane not listening yet: {}", last_failure);
            if attempt < attempts {
                tokio::time::sleep(self.config.availability_retry_delay()).await;
            }
        }

        Err(EnclaveError::engine(
            "wait for availability",
            container_id,
            format!(
                "port {} not listening after {} attempts with {:?} between them ({})",
                port,
                attempts,
                self.config.availability_retry_delay(),
                last_failure
            ),
        ))
    }

    /// Undo completed steps, newest first; returns what couldn't be undone
    async fn compensate(&self, compensations: Vec<Compensation>) -> Vec<String> {
        let mut failures = Vec::new();
        for step in compensations.into_iter().rev() {
            match step {
                Compensation::RemoveContainer(id) => {
                    if let Err(e) = self.remove_control_plane(&id).await {
                        error!("ACTION REQUIRED: failed to remove control plane container '{}' ({}); manually remove it", id, e);
                        failures.push(format!("remove container '{}': {}", id, e));
                    }
                }
                Compensation::RemoveNetwork(id) => {
                    if let Err(e) = self.engine.remove_network(&id).await {
                        error!("ACTION REQUIRED: failed to remove network '{}' ({}); manually remove it", id, e);
                        failures.push(format!("remove network '{}': {}", id, e));
                    }
                }
            }
        }
        failures
    }

    /// Graceful stop with a kill fallback, then removal so the name can be reused
    async fn remove_control_plane(&self, container_id: &str) -> EnclaveResult<()> {
        if let Err(e) = self
            .engine
            .stop_container(container_id, self.config.control_plane_stop_timeout())
            .await
        {
            warn!(container = %container_id, error = %e, "Graceful control plane stop failed, killing it");
            self.engine.kill_container(container_id).await?;
        }
        self.engine.remove_container(container_id).await?;
        Ok(())
    }

    /// Stop and remove the control plane and any leftover enclave containers, then remove the network
    ///
    /// Services should already be stopped, e.g. through [`ServiceNetwork::destroy`];
    /// whatever still carries the enclave label is force-removed here.
    pub async fn destroy_enclave(&self, handle: &EnclaveHandle) -> EnclaveResult<()> {
        self.remove_control_plane(&handle.control_plane.container_id).await?;

        let leftovers = self.engine.containers_by_labels(&handle.labels.base(), true).await?;
        let mut failures = Vec::new();
        for container in leftovers {
            debug!(container = %container.name, "Removing leftover enclave container");
            if let Err(e) = self.engine.remove_container(&container.id).await {
                error!("ACTION REQUIRED: failed to remove container '{}' ({}); manually remove it", container.name, e);
                failures.push(format!("remove container '{}': {}", container.name, e));
            }
        }

        self.engine.remove_network(&handle.network_id).await?;
        if !failures.is_empty() {
            return Err(EnclaveError::engine(
                "destroy enclave",
                handle.enclave_id.as_str(),
                "network removed but some containers were left behind",
            )
            .with_cleanup(failures));
        }
        info!(enclave = %handle.enclave_id, "Enclave destroyed");
        Ok(())
    }

    /// Service network bound to the enclave, with the gateway and control plane IPs held back
    pub fn network_for(
        &self,
        handle: &EnclaveHandle,
        store: Arc<dyn IpReservationStore>,
        data_dir: EnclaveDataDir,
    ) -> EnclaveResult<ServiceNetwork> {
        let ips = IpAllocator::new(handle.subnet, store);
        for ip in [handle.gateway, handle.control_plane.ip_addr] {
            // a persisted store may already hold them
            if !ips.is_reserved(ip)? {
                ips.reserve(ip)?;
            }
        }

        Ok(ServiceNetwork::new(
            self.engine.clone(),
            NetworkBinding {
                enclave_id: handle.enclave_id.clone(),
                network_id: handle.network_id.clone(),
                data_volume: handle.data_volume.clone(),
                labels: handle.labels.base(),
                publish_ports: handle.publish_ports,
            },
            &self.network_config,
            handle.partitioning_enabled,
            ips,
            data_dir,
        ))
    }
}
