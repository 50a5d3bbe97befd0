//! Partition membership and the block lists derived from it
//!
//! # Invariants
//! - Every known service is in exactly one partition
//! - `service_partitions` is the exact reverse of `partition_services`
//! - A rejected change leaves the topology untouched

use crate::connection::PartitionConnection;
use crate::error::{TopologyError, TopologyResult};
use enclave_common::{PartitionConnectionId, PartitionId, ServiceId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Per service, the services it must not exchange traffic with
pub type Blocklists = BTreeMap<ServiceId, BTreeSet<ServiceId>>;

/// Per service, the packet loss toward each service in another partition
pub type PacketLossMap = BTreeMap<ServiceId, BTreeMap<ServiceId, f32>>;

/// Partition graph of one enclave
#[derive(Debug, Clone)]
pub struct PartitionTopology {
    default_connection: PartitionConnection,
    service_partitions: HashMap<ServiceId, PartitionId>,
    partition_connections: HashMap<PartitionConnectionId, PartitionConnection>,
    partition_services: HashMap<PartitionId, HashSet<ServiceId>>,
}

impl PartitionTopology {
    /// Topology with one empty partition
    pub fn new(default_partition: PartitionId, default_connection: PartitionConnection) -> Self {
        Self {
            default_connection,
            service_partitions: HashMap::new(),
            partition_connections: HashMap::new(),
            partition_services: HashMap::from([(default_partition, HashSet::new())]),
        }
    }

    /// Replace membership, connection overrides and the default connection in one step
    pub fn repartition(
        &mut self,
        new_partition_services: HashMap<PartitionId, HashSet<ServiceId>>,
        new_partition_connections: HashMap<PartitionConnectionId, PartitionConnection>,
        new_default_connection: PartitionConnection,
    ) -> TopologyResult<()> {
        if new_partition_services.is_empty() {
            return Err(TopologyError::NoPartitions);
        }

        let mut allocated: HashSet<&ServiceId> = HashSet::new();
        let mut duplicated = BTreeSet::new();
        let mut unknown = BTreeSet::new();
        for service_id in new_partition_services.values().flatten() {
            if !allocated.insert(service_id) {
                duplicated.insert(service_id.clone());
            }
            if !self.service_partitions.contains_key(service_id) {
                unknown.insert(service_id.clone());
            }
        }
        let unallocated: BTreeSet<ServiceId> = self
            .service_partitions
            .keys()
            .filter(|id| !allocated.contains(id))
            .cloned()
            .collect();

        if !duplicated.is_empty() {
            return Err(TopologyError::DuplicateAllocation(duplicated.into_iter().collect()));
        }
        if !unallocated.is_empty() {
            return Err(TopologyError::UnallocatedServices(unallocated.into_iter().collect()));
        }
        if !unknown.is_empty() {
            return Err(TopologyError::UnknownServices(unknown.into_iter().collect()));
        }

        for connection_id in new_partition_connections.keys() {
            for partition in [connection_id.first(), connection_id.second()] {
                if !new_partition_services.contains_key(partition) {
                    return Err(TopologyError::UnknownConnectionPartition {
                        partition: partition.clone(),
                        first: connection_id.first().clone(),
                        second: connection_id.second().clone(),
                    });
                }
            }
        }
        new_default_connection.validate()?;
        for connection in new_partition_connections.values() {
            connection.validate()?;
        }

        let service_partitions = new_partition_services
            .iter()
            .flat_map(|(partition, services)| {
                services.iter().map(move |s| (s.clone(), partition.clone()))
            })
            .collect();

        debug!(
            partitions = new_partition_services.len(),
            overrides = new_partition_connections.len(),
            "Applying partition topology"
        );
        self.partition_services = new_partition_services;
        self.service_partitions = service_partitions;
        self.partition_connections = new_partition_connections;
        self.default_connection = new_default_connection;
        Ok(())
    }

    /// Place a new service in an existing partition
    pub fn add_service(&mut self, service_id: ServiceId, partition_id: PartitionId) -> TopologyResult<()> {
        if let Some(existing) = self.service_partitions.get(&service_id) {
            return Err(TopologyError::AlreadyAssigned {
                service: service_id,
                partition: partition_id,
                existing: existing.clone(),
            });
        }
        let Some(services) = self.partition_services.get_mut(&partition_id) else {
            return Err(TopologyError::UnknownPartition {
                service: service_id,
                partition: partition_id,
            });
        };
        services.insert(service_id.clone());
        self.service_partitions.insert(service_id, partition_id);
        Ok(())
    }

    /// Forget a service; no-op if it isn't known
    pub fn remove_service(&mut self, service_id: &ServiceId) {
        let Some(partition_id) = self.service_partitions.remove(service_id) else {
            return;
        };
        if let Some(services) = self.partition_services.get_mut(&partition_id) {
            services.remove(service_id);
        }
    }

    pub fn partition_services(&self) -> &HashMap<PartitionId, HashSet<ServiceId>> {
        &self.partition_services
    }

    pub fn partition_connections(&self) -> &HashMap<PartitionConnectionId, PartitionConnection> {
        &self.partition_connections
    }

    pub fn default_connection(&self) -> &PartitionConnection {
        &self.default_connection
    }

    pub fn has_partition(&self, partition_id: &PartitionId) -> bool {
        self.partition_services.contains_key(partition_id)
    }

    pub fn partition_of(&self, service_id: &ServiceId) -> Option<&PartitionId> {
        self.service_partitions.get(service_id)
    }

    /// Override for the pair if there is one, else the default
    pub fn connection_between(&self, a: &PartitionId, b: &PartitionId) -> &PartitionConnection {
        self.partition_connections
            .get(&PartitionConnectionId::new(a.clone(), b.clone()))
            .unwrap_or(&self.default_connection)
    }

    /// Block list of every known service, recomputed from scratch
    pub fn blocklists(&self) -> Blocklists {
        let mut result: Blocklists = self
            .service_partitions
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        for (partition, services) in &self.partition_services {
            for (other_partition, other_services) in &self.partition_services {
                if partition == other_partition {
                    continue;
                }
                if !self.connection_between(partition, other_partition).is_blocked {
                    continue;
                }
                for service_id in services {
                    if let Some(blocked) = result.get_mut(service_id) {
                        blocked.extend(other_services.iter().cloned());
                    }
                }
            }
        }
        result
    }

    /// Loss percentage each service sees toward services in other partitions
    pub fn packet_loss_by_service(&self) -> PacketLossMap {
        let mut result = PacketLossMap::new();
        for (partition, services) in &self.partition_services {
            for service_id in services {
                let mut losses = BTreeMap::new();
                for (other_partition, other_services) in &self.partition_services {
                    if partition == other_partition {
                        continue;
                    }
                    let loss = self
                        .connection_between(partition, other_partition)
                        .effective_packet_loss();
                    for other in other_services {
                        losses.insert(other.clone(), loss);
                    }
                }
                result.insert(service_id.clone(), losses);
            }
        }
        result
    }
}
