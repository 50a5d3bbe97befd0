//! Enclave Configuration

use crate::error::{EnclaveError, EnclaveResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Service network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Partition every service starts in
    pub default_partition: String,
    /// Whether partitions without an explicit connection are blocked from each other
    pub default_connection_blocked: bool,
    /// Image used for the per-service firewall sidecar
    pub sidecar_image: String,
    /// Grace period before a stopping container is force-killed
    pub stop_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_partition: crate::DEFAULT_PARTITION_ID.into(),
            default_connection_blocked: false,
            sidecar_image: "kurtosistech/iproute2".into(),
            stop_timeout_secs: 10,
        }
    }
}

impl NetworkConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> EnclaveResult<Self> {
        load_json(path.as_ref())
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> EnclaveResult<()> {
        save_json(self, path.as_ref())
    }

    /// Container stop grace period
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Enclave provisioner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Control-plane port inside the container (TCP)
    pub control_plane_listen_port: u16,
    /// Availability probes before giving up on the control plane
    pub availability_retries: u32,
    /// Delay between availability probes
    pub availability_retry_delay_ms: u64,
    /// Host bits of each enclave subnet (12 gives a /20)
    pub subnet_width_bits: u8,
    /// Network creation attempts when the engine reports an overlapping pool
    pub network_create_retries: u32,
    /// Delay between network creation attempts
    pub network_create_retry_delay_ms: u64,
    /// Grace period for stopping the control plane
    pub control_plane_stop_timeout_secs: u64,
    /// Mount point of the enclave data volume inside containers
    pub enclave_data_mount_dirpath: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            control_plane_listen_port: 7443,
            availability_retries: 10,
            availability_retry_delay_ms: 1000,
            subnet_width_bits: 12,
            network_create_retries: 10,
            network_create_retry_delay_ms: 1000,
            control_plane_stop_timeout_secs: 180,
            enclave_data_mount_dirpath: "/enclave-data".into(),
        }
    }
}

impl ProvisionerConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> EnclaveResult<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> EnclaveResult<()> {
        save_json(self, path.as_ref())
    }

    /// Reject settings no subnet search could satisfy
    pub fn validate(&self) -> EnclaveResult<()> {
        if !(2..=24).contains(&self.subnet_width_bits) {
            return Err(EnclaveError::Config(format!(
                "subnet_width_bits must be between 2 and 24, got {}",
                self.subnet_width_bits
            )));
        }
        if self.availability_retries == 0 || self.network_create_retries == 0 {
            return Err(EnclaveError::Config("retry counts must be at least 1".into()));
        }
        Ok(())
    }

    /// Delay between availability probes
    pub fn availability_retry_delay(&self) -> Duration {
        Duration::from_millis(self.availability_retry_delay_ms)
    }

    /// Delay between network creation attempts
    pub fn network_create_retry_delay(&self) -> Duration {
        Duration::from_millis(self.network_create_retry_delay_ms)
    }

    /// Control-plane stop grace period
    pub fn control_plane_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.control_plane_stop_timeout_secs)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> EnclaveResult<T> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| EnclaveError::Config(format!("{}: {}", path.display(), e)))
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> EnclaveResult<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| EnclaveError::Config(e.to_string()))?;
    std::fs::write(path, content)?;
    Ok(())
}
