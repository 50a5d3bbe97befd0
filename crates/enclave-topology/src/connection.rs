//! Connection policy between two partitions

use crate::error::{TopologyError, TopologyResult};
use serde::{Deserialize, Serialize};

/// Delay applied to packets crossing a connection
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PacketDelayDistribution {
    pub avg_delay_ms: u32,
    pub jitter_ms: u32,
    /// Percentage (0-100) each delay depends on the previous one
    pub correlation: f32,
}

/// How traffic between two partitions behaves
///
/// When `is_blocked` is set, loss and delay are irrelevant.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PartitionConnection {
    pub is_blocked: bool,
    pub packet_loss_percentage: Option<f32>,
    pub packet_delay: Option<PacketDelayDistribution>,
}

impl PartitionConnection {
    pub fn blocked() -> Self {
        Self { is_blocked: true, ..Default::default() }
    }

    pub fn unblocked() -> Self {
        Self::default()
    }

    pub fn with_packet_loss(mut self, percentage: f32) -> Self {
        self.packet_loss_percentage = Some(percentage);
        self
    }

    pub fn with_packet_delay(mut self, delay: PacketDelayDistribution) -> Self {
        self.packet_delay = Some(delay);
        self
    }

    /// Loss toward the far side: 100 when blocked, else the configured loss or 0
    pub fn effective_packet_loss(&self) -> f32 {
        if self.is_blocked {
            100.0
        } else {
            self.packet_loss_percentage.unwrap_or(0.0)
        }
    }

    /// True if an unblocked connection asks for loss or delay
    pub fn has_shaping(&self) -> bool {
        if self.is_blocked {
            return false;
        }
        let lossy = self.packet_loss_percentage.is_some_and(|p| p > 0.0);
        let delayed = self
            .packet_delay
            .is_some_and(|d| d.avg_delay_ms > 0 || d.jitter_ms > 0);
        lossy || delayed
    }

    pub fn validate(&self) -> TopologyResult<()> {
        if let Some(loss) = self.packet_loss_percentage {
            if !(0.0..=100.0).contains(&loss) {
                return Err(TopologyError::InvalidConnection(format!(
                    "packet loss percentage must be between 0 and 100, got {}",
                    loss
                )));
            }
        }
        if let Some(delay) = self.packet_delay {
            if !(0.0..=100.0).contains(&delay.correlation) {
                return Err(TopologyError::InvalidConnection(format!(
                    "delay correlation must be between 0 and 100, got {}",
                    delay.correlation
                )));
            }
        }
        Ok(())
    }
}
