//! Engine object names and labels for one enclave

use enclave_common::labels::{CONTAINER_TYPE_LABEL, CONTROL_PLANE_CONTAINER_TYPE, ENCLAVE_ID_LABEL};
use enclave_engine::Labels;

/// Names every engine object of an enclave derives from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveObjectNames {
    enclave_id: String,
}

impl EnclaveObjectNames {
    pub fn new(enclave_id: impl Into<String>) -> Self {
        Self { enclave_id: enclave_id.into() }
    }

    pub fn enclave_id(&self) -> &str {
        &self.enclave_id
    }

    /// The network carries the enclave id verbatim; it doubles as the existence check
    pub fn network_name(&self) -> String {
        self.enclave_id.clone()
    }

    pub fn data_volume_name(&self) -> String {
        format!("{}-data", self.enclave_id)
    }

    pub fn control_plane_container_name(&self) -> String {
        format!("{}--control-plane", self.enclave_id)
    }

    /// Prefix for service and sidecar container names
    pub fn container_name_prefix(&self) -> String {
        self.enclave_id.clone()
    }
}

/// Labels stamped on enclave objects so they can be found again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveLabels {
    enclave_id: String,
}

impl EnclaveLabels {
    pub fn new(enclave_id: impl Into<String>) -> Self {
        Self { enclave_id: enclave_id.into() }
    }

    pub fn base(&self) -> Labels {
        Labels::from([(ENCLAVE_ID_LABEL.to_string(), self.enclave_id.clone())])
    }

    pub fn control_plane(&self) -> Labels {
        let mut labels = self.base();
        labels.insert(CONTAINER_TYPE_LABEL.into(), CONTROL_PLANE_CONTAINER_TYPE.into());
        labels
    }
}
