//! Topology errors

use enclave_common::{EnclaveError, PartitionId, ServiceId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("cannot repartition with no partitions")]
    NoPartitions,

    #[error("the following services have partitions defined twice: {}", join(.0))]
    DuplicateAllocation(Vec<ServiceId>),

    #[error("all services must be allocated to a partition when repartitioning, but the following weren't accounted for: {}", join(.0))]
    UnallocatedServices(Vec<ServiceId>),

    #[error("the following services are unknown, but have partition definitions: {}", join(.0))]
    UnknownServices(Vec<ServiceId>),

    #[error("partition '{partition}' in partition connection '{first}' <-> '{second}' doesn't exist")]
    UnknownConnectionPartition {
        partition: PartitionId,
        first: PartitionId,
        second: PartitionId,
    },

    #[error("cannot assign service '{service}' to partition '{partition}'; the partition doesn't exist")]
    UnknownPartition { service: ServiceId, partition: PartitionId },

    #[error("cannot add service '{service}' to partition '{partition}' because the service is already assigned to partition '{existing}'")]
    AlreadyAssigned {
        service: ServiceId,
        partition: PartitionId,
        existing: PartitionId,
    },

    #[error("invalid connection: {0}")]
    InvalidConnection(String),
}

fn join(ids: &[ServiceId]) -> String {
    ids.iter().map(ServiceId::as_str).collect::<Vec<_>>().join(", ")
}

impl From<TopologyError> for EnclaveError {
    fn from(err: TopologyError) -> Self {
        EnclaveError::Validation(err.to_string())
    }
}

pub type TopologyResult<T> = Result<T, TopologyError>;
