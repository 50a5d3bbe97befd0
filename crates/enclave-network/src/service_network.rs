//! Service Network
//!
//! Registers, starts, partitions and removes the services of one enclave.
//!
//! # Locking
//!
//! All mutable state lives in [`NetworkState`] behind a single async mutex
//! that every operation holds for its whole duration, engine calls included.
//! Helpers take `&mut NetworkState`, so they can only run under the lock.
//!
//! # Service lifecycle
//!
//! ```text
//! Unregistered -> Registered -> Running -> Removed
//!                     ^            |
//!                     +-- failed --+
//!                         start
//! ```

use crate::cleanup::ContainerCleanup;
use crate::data_dir::{EnclaveDataDir, ServiceDirectory};
use crate::ip_allocator::IpAllocator;
use crate::launcher::{ServiceConfig, ServiceLauncher};
use chrono::{DateTime, Utc};
use enclave_common::{
    EnclaveError, EnclaveResult, NetworkConfig, PartitionConnectionId, PartitionId, ServiceGuid,
    ServiceId,
};
use enclave_engine::{ContainerEngine, Labels, PortBinding};
use enclave_sidecar::{FirewallEnforcer, SidecarRegistry};
use enclave_topology::{Blocklists, PacketLossMap, PartitionConnection, PartitionTopology};
use scopeguard::ScopeGuard;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Where on the engine a service network lives
#[derive(Debug, Clone)]
pub struct NetworkBinding {
    pub enclave_id: String,
    pub network_id: String,
    /// Volume mounted into every service as the enclave data dir
    pub data_volume: String,
    /// Labels stamped on every container this network starts
    pub labels: Labels,
    pub publish_ports: bool,
}

/// Exists from registration until removal
#[derive(Debug, Clone)]
pub struct ServiceRegistrationInfo {
    pub guid: ServiceGuid,
    pub ip_addr: Ipv4Addr,
    pub directory: ServiceDirectory,
}

/// Exists only while the service container runs
#[derive(Debug, Clone)]
pub struct ServiceRunInfo {
    pub container_id: String,
    pub enclave_data_dir_mnt_dirpath: String,
    pub host_port_bindings: HashMap<String, PortBinding>,
    pub started_at: DateTime<Utc>,
}

/// Everything the network mutex guards
pub struct NetworkState {
    default_partition: PartitionId,
    topology: PartitionTopology,
    ip_allocator: IpAllocator,
    data_dir: EnclaveDataDir,
    launcher: ServiceLauncher,
    sidecars: SidecarRegistry,
    registrations: HashMap<ServiceId, ServiceRegistrationInfo>,
    run_infos: HashMap<ServiceId, ServiceRunInfo>,
}

/// Service network of one enclave
pub struct ServiceNetwork {
    enclave_id: String,
    partitioning_enabled: bool,
    stop_timeout: Duration,
    destroyed: AtomicBool,
    state: Mutex<NetworkState>,
}

impl ServiceNetwork {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        binding: NetworkBinding,
        config: &NetworkConfig,
        partitioning_enabled: bool,
        ip_allocator: IpAllocator,
        data_dir: EnclaveDataDir,
    ) -> Self {
        let default_partition = PartitionId::new(config.default_partition.clone());
        let default_connection = if config.default_connection_blocked {
            PartitionConnection::blocked()
        } else {
            PartitionConnection::unblocked()
        };
        let launcher = ServiceLauncher::new(
            engine.clone(),
            binding.network_id,
            binding.data_volume,
            binding.enclave_id.clone(),
            binding.labels.clone(),
            binding.publish_ports,
        );
        let sidecars = SidecarRegistry::new(
            engine,
            config.sidecar_image.clone(),
            binding.enclave_id.clone(),
            binding.labels,
        );

        Self {
            enclave_id: binding.enclave_id,
            partitioning_enabled,
            stop_timeout: config.stop_timeout(),
            destroyed: AtomicBool::new(false),
            state: Mutex::new(NetworkState {
                topology: PartitionTopology::new(default_partition.clone(), default_connection),
                default_partition,
                ip_allocator,
                data_dir,
                launcher,
                sidecars,
                registrations: HashMap::new(),
                run_infos: HashMap::new(),
            }),
        }
    }

    pub fn enclave_id(&self) -> &str {
        &self.enclave_id
    }

    pub fn partitioning_enabled(&self) -> bool {
        self.partitioning_enabled
    }

    /// Configured grace period for stopping service containers
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Lock the state of a live network
    async fn lock(&self) -> EnclaveResult<MutexGuard<'_, NetworkState>> {
        if self.is_destroyed() {
            return Err(EnclaveError::NetworkDestroyed);
        }
        let state = self.state.lock().await;
        if self.is_destroyed() {
            return Err(EnclaveError::NetworkDestroyed);
        }
        Ok(state)
    }

    /// Reserve an IP and a data directory for a service without starting it
    ///
    /// Returns the service IP and its directory relative to the data dir root.
    pub async fn register_service(
        &self,
        service_id: ServiceId,
        partition_id: Option<PartitionId>,
    ) -> EnclaveResult<(Ipv4Addr, String)> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;

        if service_id.is_blank() {
            return Err(EnclaveError::Validation("service ID cannot be empty or whitespace".into()));
        }
        if !service_id.is_valid_name() {
            return Err(EnclaveError::Validation(format!(
                "service ID '{}' must start with a letter or digit and contain only letters, digits, '_', '.' and '-'",
                service_id
            )));
        }
        if state.registrations.contains_key(&service_id) {
            return Err(EnclaveError::Validation(format!(
                "cannot register service '{}'; a service with that ID already exists",
                service_id
            )));
        }
        let partition_id = partition_id
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| state.default_partition.clone());
        if !state.topology.has_partition(&partition_id) {
            return Err(EnclaveError::Validation(format!(
                "no partition with ID '{}' exists in the current partition topology",
                partition_id
            )));
        }

        let ip = state.ip_allocator.allocate()?;
        let allocator = &state.ip_allocator;
        let ip_guard = scopeguard::guard(ip, |ip| {
            if let Err(e) = allocator.release(ip) {
                error!("ACTION REQUIRED: failed to release IP {} ({}); it stays reserved", ip, e);
            }
        });
        debug!(service = %service_id, ip = %ip, "Giving service IP");

        let guid = ServiceGuid::generate(&service_id);
        let directory = state.data_dir.service_directory(&guid).await?;
        if let Err(e) = state.topology.add_service(service_id.clone(), partition_id.clone()) {
            if let Err(rm) = directory.remove().await {
                error!(
                    "ACTION REQUIRED: failed to delete service directory '{}' ({}); delete it manually",
                    directory.absolute_path().display(),
                    rm
                );
            }
            return Err(e.into());
        }

        let relative = directory.relative_dirpath().to_string();
        state.registrations.insert(
            service_id.clone(),
            ServiceRegistrationInfo { guid, ip_addr: ip, directory },
        );
        let ip = ScopeGuard::into_inner(ip_guard);

        info!(service = %service_id, ip = %ip, partition = %partition_id, "Registered service");
        Ok((ip, relative))
    }

    /// Start the container of a registered service
    ///
    /// Returns the host bindings of its published ports, keyed by port ID.
    pub async fn start_service(
        &self,
        service_id: &ServiceId,
        config: ServiceConfig,
    ) -> EnclaveResult<HashMap<String, PortBinding>> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;

        let registration = state.registrations.get(service_id).cloned().ok_or_else(|| {
            EnclaveError::NotFound(format!(
                "cannot start service '{}'; no service with that ID has been registered",
                service_id
            ))
        })?;
        if state.run_infos.contains_key(service_id) {
            return Err(EnclaveError::Validation(format!(
                "cannot start service '{}'; it is already running",
                service_id
            )));
        }

        if self.partitioning_enabled {
            // Peers drop the new service's traffic before it exists
            let mut blocklists = state.topology.blocklists();
            blocklists.remove(service_id);
            push_blocklists(state, &blocklists).await?;
        }

        let launched = state
            .launcher
            .launch(service_id, &registration.guid, registration.ip_addr, &config)
            .await?;
        let mut cleanup = ContainerCleanup::new(state.launcher.engine().clone());
        cleanup.track(launched.container_id.clone());

        let sidecar = if self.partitioning_enabled {
            isolate_new_service(state, service_id, &registration.guid, &launched.container_id, &mut cleanup)
                .await
                .map(Some)
        } else {
            Ok(None)
        };
        // No await from here to disarm: the sidecar entry and run info land together or not at all
        let committed = sidecar.and_then(|sidecar| match sidecar {
            Some(sidecar) => state.sidecars.insert(service_id.clone(), sidecar),
            None => Ok(()),
        });
        if let Err(err) = committed {
            let failures = cleanup.run().await;
            warn!(service = %service_id, error = %err, "Start failed after launch; container torn down");
            return Err(err.with_cleanup(failures));
        }

        state.run_infos.insert(
            service_id.clone(),
            ServiceRunInfo {
                container_id: launched.container_id.clone(),
                enclave_data_dir_mnt_dirpath: config.enclave_data_dir_mnt_dirpath.clone(),
                host_port_bindings: launched.host_port_bindings.clone(),
                started_at: Utc::now(),
            },
        );
        cleanup.disarm();

        info!(service = %service_id, container = %launched.container_id, "Service running");
        Ok(launched.host_port_bindings)
    }

    /// Replace the partition topology and push new block lists to every running service
    pub async fn repartition(
        &self,
        partition_services: HashMap<PartitionId, HashSet<ServiceId>>,
        partition_connections: HashMap<PartitionConnectionId, PartitionConnection>,
        default_connection: PartitionConnection,
    ) -> EnclaveResult<()> {
        let mut guard = self.lock().await?;
        let state = &mut *guard;
        if !self.partitioning_enabled {
            return Err(EnclaveError::PartitioningDisabled);
        }

        let shaped: Vec<String> = partition_connections
            .iter()
            .filter(|(_, c)| c.has_shaping())
            .map(|(id, _)| id.to_string())
            .chain(default_connection.has_shaping().then(|| "default".to_string()))
            .collect();

        state
            .topology
            .repartition(partition_services, partition_connections, default_connection)?;
        if !shaped.is_empty() {
            warn!(
                connections = ?shaped,
                "Packet loss and delay are recorded but not enforced; only blocking is applied"
            );
        }

        let blocklists = state.topology.blocklists();
        push_blocklists(state, &blocklists).await?;
        info!(partitions = state.topology.partition_services().len(), "Repartitioned network");
        Ok(())
    }

    /// Stop a service and release everything it holds
    pub async fn remove_service(&self, service_id: &ServiceId, stop_timeout: Duration) -> EnclaveResult<()> {
        let mut guard = self.lock().await?;
        remove_service_locked(&mut guard, service_id, stop_timeout).await
    }

    /// Run a command in a running service; returns exit code and output
    ///
    /// Holds the network lock until the command finishes.
    pub async fn exec_command(&self, service_id: &ServiceId, argv: &[String]) -> EnclaveResult<(i32, String)> {
        let guard = self.lock().await?;
        let run_info = guard.run_infos.get(service_id).ok_or_else(|| {
            EnclaveError::NotFound(format!(
                "cannot exec in service '{}'; it isn't running",
                service_id
            ))
        })?;
        let output = guard.launcher.exec(&run_info.container_id, argv).await?;
        Ok((output.exit_code, output.output))
    }

    /// Copy `src_path` out of a running service as a tar archive
    ///
    /// Holds the network lock until the copy finishes.
    pub async fn copy_from_service(&self, service_id: &ServiceId, src_path: &str) -> EnclaveResult<Vec<u8>> {
        let guard = self.lock().await?;
        let run_info = guard.run_infos.get(service_id).ok_or_else(|| {
            EnclaveError::NotFound(format!(
                "cannot copy from service '{}'; it isn't running",
                service_id
            ))
        })?;
        guard.launcher.copy_from(&run_info.container_id, src_path).await
    }

    pub async fn service_ip(&self, service_id: &ServiceId) -> Option<Ipv4Addr> {
        self.state.lock().await.registrations.get(service_id).map(|r| r.ip_addr)
    }

    pub async fn relative_service_dirpath(&self, service_id: &ServiceId) -> Option<String> {
        self.state
            .lock()
            .await
            .registrations
            .get(service_id)
            .map(|r| r.directory.relative_dirpath().to_string())
    }

    pub async fn service_enclave_data_dir_mnt_dirpath(&self, service_id: &ServiceId) -> Option<String> {
        self.state
            .lock()
            .await
            .run_infos
            .get(service_id)
            .map(|r| r.enclave_data_dir_mnt_dirpath.clone())
    }

    pub async fn run_info(&self, service_id: &ServiceId) -> Option<ServiceRunInfo> {
        self.state.lock().await.run_infos.get(service_id).cloned()
    }

    /// Running services
    pub async fn service_ids(&self) -> BTreeSet<ServiceId> {
        self.state.lock().await.run_infos.keys().cloned().collect()
    }

    /// Registered services, running or not
    pub async fn registered_service_ids(&self) -> BTreeSet<ServiceId> {
        self.state.lock().await.registrations.keys().cloned().collect()
    }

    pub async fn partition_of(&self, service_id: &ServiceId) -> Option<PartitionId> {
        self.state.lock().await.topology.partition_of(service_id).cloned()
    }

    pub async fn blocklists(&self) -> Blocklists {
        self.state.lock().await.topology.blocklists()
    }

    /// Configured loss toward other partitions; recorded only, never enforced
    pub async fn packet_loss_by_service(&self) -> PacketLossMap {
        self.state.lock().await.topology.packet_loss_by_service()
    }

    /// Mark the network destroyed and remove every service, best effort
    pub async fn destroy(&self, stop_timeout: Duration) -> EnclaveResult<()> {
        let mut guard = self.lock().await?;
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(EnclaveError::NetworkDestroyed);
        }

        let mut ids: Vec<ServiceId> = guard.registrations.keys().cloned().collect();
        ids.sort();
        let mut failures = Vec::new();
        for service_id in ids {
            if let Err(e) = remove_service_locked(&mut guard, &service_id, stop_timeout).await {
                error!("ACTION REQUIRED: failed to remove service '{}' ({}); clean it up manually", service_id, e);
                failures.push(format!("remove service '{}': {}", service_id, e));
            }
        }

        info!(enclave = %self.enclave_id, "Destroyed service network");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EnclaveError::NetworkDestroyed.with_cleanup(failures))
        }
    }
}

/// Launch, initialize and program the sidecar of a just-launched service
///
/// The sidecar container goes to `cleanup`; the caller registers the sidecar
/// once the start commits.
async fn isolate_new_service(
    state: &NetworkState,
    service_id: &ServiceId,
    guid: &ServiceGuid,
    container_id: &str,
    cleanup: &mut ContainerCleanup,
) -> EnclaveResult<Arc<dyn FirewallEnforcer>> {
    let sidecar = state.sidecars.launch(service_id, guid, container_id).await?;
    cleanup.track(sidecar.container_id());
    sidecar.initialize_rules().await?;

    let blocked = state.topology.blocklists().remove(service_id).unwrap_or_default();
    let ips = blocked_ips(&state.registrations, service_id, &blocked)?;
    sidecar.update_rules(&ips).await?;
    Ok(sidecar)
}

async fn remove_service_locked(
    state: &mut NetworkState,
    service_id: &ServiceId,
    stop_timeout: Duration,
) -> EnclaveResult<()> {
    let ip = state
        .registrations
        .get(service_id)
        .map(|r| r.ip_addr)
        .ok_or_else(|| EnclaveError::NotFound(format!("no registration found for service '{}'", service_id)))?;

    if let Some(run_info) = state.run_infos.get(service_id) {
        state.launcher.stop(&run_info.container_id, stop_timeout).await?;
        state.run_infos.remove(service_id);
    }
    // Keeps its entry on failure, so removing the service again retries it
    state.sidecars.remove(service_id).await?;
    state.ip_allocator.release(ip)?;
    state.topology.remove_service(service_id);
    state.registrations.remove(service_id);

    info!(service = %service_id, ip = %ip, "Removed service");
    Ok(())
}

/// Update the sidecar of every running service named in `blocklists`
async fn push_blocklists(state: &NetworkState, blocklists: &Blocklists) -> EnclaveResult<()> {
    for (service_id, blocked) in blocklists {
        if !state.run_infos.contains_key(service_id) {
            continue;
        }
        let sidecar = state.sidecars.get(service_id).ok_or_else(|| {
            EnclaveError::Internal(format!("running service '{}' has no networking sidecar", service_id))
        })?;
        let ips = blocked_ips(&state.registrations, service_id, blocked)?;
        sidecar.update_rules(&ips).await?;
    }
    Ok(())
}

fn blocked_ips(
    registrations: &HashMap<ServiceId, ServiceRegistrationInfo>,
    service_id: &ServiceId,
    blocked: &BTreeSet<ServiceId>,
) -> EnclaveResult<Vec<Ipv4Addr>> {
    blocked
        .iter()
        .map(|other| {
            registrations.get(other).map(|r| r.ip_addr).ok_or_else(|| {
                EnclaveError::Internal(format!(
                    "service '{}' must block '{}', which has no registration",
                    service_id, other
                ))
            })
        })
        .collect()
}
