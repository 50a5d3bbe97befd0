//! Random free-subnet search and network creation with overlap retries

use enclave_common::{EnclaveError, EnclaveResult};
use enclave_engine::{ContainerEngine, Labels};
use ipnetwork::Ipv4Network;
use rand::Rng;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};

/// Inclusive ranges an enclave subnet must never touch
const DISALLOWED_RANGES: &[(Ipv4Addr, Ipv4Addr)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(0, 255, 255, 255)),
    (Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 255, 255, 255)),
    (Ipv4Addr::new(100, 64, 0, 0), Ipv4Addr::new(100, 127, 255, 255)),
    (Ipv4Addr::new(127, 0, 0, 0), Ipv4Addr::new(127, 255, 255, 255)),
    (Ipv4Addr::new(169, 254, 0, 0), Ipv4Addr::new(169, 254, 255, 255)),
    (Ipv4Addr::new(172, 16, 0, 0), Ipv4Addr::new(172, 31, 255, 255)),
    (Ipv4Addr::new(192, 0, 0, 0), Ipv4Addr::new(192, 0, 0, 255)),
    (Ipv4Addr::new(192, 0, 2, 0), Ipv4Addr::new(192, 0, 2, 255)),
    (Ipv4Addr::new(192, 88, 99, 0), Ipv4Addr::new(192, 88, 99, 255)),
    (Ipv4Addr::new(192, 168, 0, 0), Ipv4Addr::new(192, 168, 255, 255)),
    (Ipv4Addr::new(198, 18, 0, 0), Ipv4Addr::new(198, 19, 255, 255)),
    (Ipv4Addr::new(198, 51, 100, 0), Ipv4Addr::new(198, 51, 100, 255)),
    (Ipv4Addr::new(203, 0, 113, 0), Ipv4Addr::new(203, 0, 113, 255)),
    // multicast, then reserved up to broadcast
    (Ipv4Addr::new(224, 0, 0, 0), Ipv4Addr::new(239, 255, 255, 255)),
    (Ipv4Addr::new(240, 0, 0, 0), Ipv4Addr::new(255, 255, 255, 255)),
];

/// A created enclave network
#[derive(Debug, Clone)]
pub struct AllocatedNetwork {
    pub network_id: String,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
}

/// Finds free subnets and creates engine networks on them
pub struct NetworkAllocator {
    width_bits: u8,
    max_attempts: u32,
    retry_delay: Duration,
}

impl NetworkAllocator {
    pub fn new(width_bits: u8, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            width_bits,
            max_attempts,
            retry_delay,
        }
    }

    /// Create a network named `name` on a random free subnet
    ///
    /// The engine may reject the subnet with a pool overlap when another
    /// network grabbed it between listing and creation, or when a removed
    /// network's addresses aren't freed yet. Those are retried up to the
    /// configured attempt count; any other engine failure is returned as is.
    pub async fn create_network(
        &self,
        engine: &dyn ContainerEngine,
        name: &str,
        labels: &Labels,
    ) -> EnclaveResult<AllocatedNetwork> {
        for attempt in 1..=self.max_attempts {
            let used = engine.list_network_subnets().await?;
            let subnet = {
                let mut rng = rand::thread_rng();
                find_free_subnet(&mut rng, self.width_bits, &used)?
            };
            let gateway = first_host(subnet);

            match engine.create_network(name, subnet, gateway, labels).await {
                Ok(network_id) => {
                    info!(network = %name, id = %network_id, subnet = %subnet, "Created enclave network");
                    return Ok(AllocatedNetwork { network_id, subnet, gateway });
                }
                Err(e) if e.is_pool_overlap() => {
                    debug!(
                        network = %name,
                        subnet = %subnet,
                        attempt,
                        "Subnet overlaps an existing pool, retrying in {:?}",
                        self.retry_delay
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EnclaveError::engine(
            "create network",
            name,
            format!(
                "no free subnet after {} attempts with {:?} between them",
                self.max_attempts, self.retry_delay
            ),
        ))
    }
}

/// Gateway address of an enclave subnet
pub fn first_host(subnet: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + 1)
}

/// Pick a free block of `2^width_bits` addresses
///
/// The search starts at a random block and walks forward, wrapping around
/// the address space, skipping disallowed ranges and anything overlapping
/// `used`.
pub fn find_free_subnet<R: Rng + ?Sized>(
    rng: &mut R,
    width_bits: u8,
    used: &[Ipv4Network],
) -> EnclaveResult<Ipv4Network> {
    if !(2..=24).contains(&width_bits) {
        return Err(EnclaveError::Config(format!(
            "subnet width must be between 2 and 24 bits, got {}",
            width_bits
        )));
    }
    let block_size = 1u64 << width_bits;
    let block_count = (1u64 << 32) / block_size;
    let prefix = 32 - width_bits;
    let start = rng.gen_range(0..block_count);

    for offset in 0..block_count {
        let base = ((start + offset) % block_count) * block_size;
        let first = base as u32;
        let last = (base + block_size - 1) as u32;
        if is_disallowed(first, last) {
            continue;
        }
        let candidate = Ipv4Network::new(Ipv4Addr::from(first), prefix)
            .map_err(|e| EnclaveError::Internal(format!("invalid candidate subnet: {}", e)))?;
        if used.iter().any(|u| overlaps(&candidate, u)) {
            continue;
        }
        return Ok(candidate);
    }

    Err(EnclaveError::Validation(format!(
        "no free /{} subnet left in the address space",
        prefix
    )))
}

fn is_disallowed(first: u32, last: u32) -> bool {
    DISALLOWED_RANGES
        .iter()
        .any(|(lo, hi)| first <= u32::from(*hi) && last >= u32::from(*lo))
}

fn overlaps(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_engine::fake::ops;
    use enclave_engine::FakeEngine;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_free_subnet_avoids_disallowed_and_used() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut used = Vec::new();
        for _ in 0..200 {
            let subnet = find_free_subnet(&mut rng, 12, &used).unwrap();
            assert_eq!(subnet.prefix(), 20);
            let first = u32::from(subnet.network());
            let last = u32::from(subnet.broadcast());
            assert!(!is_disallowed(first, last), "{} is disallowed", subnet);
            assert!(used.iter().all(|u| !overlaps(&subnet, u)));
            used.push(subnet);
        }
    }

    #[test]
    fn test_large_used_network_is_skipped() {
        let used: Vec<Ipv4Network> = vec!["0.0.0.0/1".parse().unwrap()];
        let mut rng = StdRng::seed_from_u64(1);
        let subnet = find_free_subnet(&mut rng, 12, &used).unwrap();
        assert!(u32::from(subnet.network()) >= 1 << 31);
    }

    #[test]
    fn test_exhausted_space_errors() {
        let used: Vec<Ipv4Network> = vec!["0.0.0.0/0".parse().unwrap()];
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            find_free_subnet(&mut rng, 12, &used),
            Err(EnclaveError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_bad_width() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(find_free_subnet(&mut rng, 30, &[]), Err(EnclaveError::Config(_))));
    }

    #[test]
    fn test_first_host() {
        let subnet: Ipv4Network = "44.12.16.0/20".parse().unwrap();
        assert_eq!(first_host(subnet), Ipv4Addr::new(44, 12, 16, 1));
    }

    #[tokio::test]
    async fn test_retries_pool_overlap() {
        let engine = FakeEngine::new();
        engine.overlap_pools(2);
        let allocator = NetworkAllocator::new(12, 3, Duration::from_millis(1));

        let network = allocator.create_network(&engine, "enclave", &Labels::new()).await.unwrap();
        assert_eq!(network.gateway, first_host(network.subnet));
        assert_eq!(engine.networks().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let engine = FakeEngine::new();
        engine.overlap_pools(5);
        let allocator = NetworkAllocator::new(12, 3, Duration::from_millis(1));

        assert!(allocator.create_network(&engine, "enclave", &Labels::new()).await.is_err());
        assert!(engine.networks().is_empty());
    }

    #[tokio::test]
    async fn test_other_engine_errors_are_not_retried() {
        let engine = FakeEngine::new();
        engine.fail(ops::CREATE_NETWORK, 1);
        let allocator = NetworkAllocator::new(12, 3, Duration::from_millis(1));

        assert!(allocator.create_network(&engine, "enclave", &Labels::new()).await.is_err());
        // the second attempt would have succeeded
        assert!(engine.networks().is_empty());
    }
}
