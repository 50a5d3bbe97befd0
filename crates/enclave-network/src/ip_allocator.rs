//! IPv4 allocation within an enclave subnet

use crate::store::IpReservationStore;
use enclave_common::{EnclaveError, EnclaveResult};
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// Hands out unique host addresses of one subnet
///
/// The network and broadcast addresses are never handed out. Reservations
/// live in the store, so they outlast the allocator.
pub struct IpAllocator {
    subnet: Ipv4Network,
    store: Arc<dyn IpReservationStore>,
}

impl IpAllocator {
    pub fn new(subnet: Ipv4Network, store: Arc<dyn IpReservationStore>) -> Self {
        Self { subnet, store }
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// Reserve the lowest free host address
    pub fn allocate(&self) -> EnclaveResult<Ipv4Addr> {
        let (first, last) = self.host_range();
        let mut allocated = None;
        self.store.update(&mut |taken| {
            let free = (first..=last)
                .map(Ipv4Addr::from)
                .find(|ip| !taken.contains(ip))
                .ok_or_else(|| EnclaveError::IpExhausted { subnet: self.subnet.to_string() })?;
            taken.insert(free);
            allocated = Some(free);
            Ok(())
        })?;

        let ip = allocated.ok_or_else(|| EnclaveError::Internal("allocation committed no address".into()))?;
        debug!(subnet = %self.subnet, ip = %ip, "Allocated IP");
        Ok(ip)
    }

    /// Reserve a specific address, e.g. the gateway
    pub fn reserve(&self, ip: Ipv4Addr) -> EnclaveResult<()> {
        if !self.subnet.contains(ip) {
            return Err(EnclaveError::Validation(format!(
                "IP {} is outside subnet {}",
                ip, self.subnet
            )));
        }
        self.store.update(&mut |taken| {
            if !taken.insert(ip) {
                return Err(EnclaveError::Validation(format!("IP {} is already reserved", ip)));
            }
            Ok(())
        })
    }

    /// Return an address to the pool; releasing a free address is a no-op
    pub fn release(&self, ip: Ipv4Addr) -> EnclaveResult<()> {
        self.store.update(&mut |taken| {
            taken.remove(&ip);
            Ok(())
        })?;
        debug!(subnet = %self.subnet, ip = %ip, "Released IP");
        Ok(())
    }

    pub fn is_reserved(&self, ip: Ipv4Addr) -> EnclaveResult<bool> {
        Ok(self.store.load()?.contains(&ip))
    }

    /// Reserved addresses inside this subnet
    pub fn reserved(&self) -> EnclaveResult<BTreeSet<Ipv4Addr>> {
        Ok(self
            .store
            .load()?
            .into_iter()
            .filter(|ip| self.subnet.contains(*ip))
            .collect())
    }

    /// First and last assignable host as integers; empty when first > last
    fn host_range(&self) -> (u32, u32) {
        let network = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());
        (network.saturating_add(1), broadcast.saturating_sub(1))
    }
}
