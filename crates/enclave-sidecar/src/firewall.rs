//! Double-buffered iptables rules
//!
//! Two user chains, `ENCLAVE_A` and `ENCLAVE_B`. `INPUT` and `OUTPUT` jump to
//! the active one at position 1. An update rebuilds the background chain,
//! repoints both hooks at it and flushes the old chain, all inside one
//! `iptables-restore` commit.

use async_trait::async_trait;
use enclave_common::{EnclaveError, EnclaveResult, ServiceId};
use enclave_engine::ContainerEngine;
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One of the two enclave chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    A,
    B,
}

impl Chain {
    pub fn name(&self) -> &'static str {
        match self {
            Self::A => "ENCLAVE_A",
            Self::B => "ENCLAVE_B",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which chain the hooks point at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveChain {
    Uninitialized,
    Active(Chain),
}

/// Enforces a service's block list inside its network namespace
#[async_trait]
pub trait FirewallEnforcer: Send + Sync {
    fn service_id(&self) -> &ServiceId;

    /// Container holding the rules
    fn container_id(&self) -> &str;

    async fn active_chain(&self) -> ActiveChain;

    /// Install both chains with nothing blocked; no-op once initialized
    async fn initialize_rules(&self) -> EnclaveResult<()>;

    /// Replace the blocked set; requires initialization
    async fn update_rules(&self, blocked_ips: &[Ipv4Addr]) -> EnclaveResult<()>;
}

/// [`FirewallEnforcer`] running `iptables-restore` through engine exec
pub struct IptablesEnforcer {
    service_id: ServiceId,
    container_id: String,
    engine: Arc<dyn ContainerEngine>,
    chain: Mutex<ActiveChain>,
}

impl IptablesEnforcer {
    pub fn new(service_id: ServiceId, container_id: impl Into<String>, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            service_id,
            container_id: container_id.into(),
            engine,
            chain: Mutex::new(ActiveChain::Uninitialized),
        }
    }

    async fn restore(&self, rules: &str) -> EnclaveResult<()> {
        let argv = restore_command(rules);
        debug!(service = %self.service_id, container = %self.container_id, rules, "Applying iptables rules");
        let output = self.engine.run_exec_command(&self.container_id, &argv).await?;
        if !output.is_success() {
            return Err(EnclaveError::Firewall {
                service: self.service_id.to_string(),
                message: format!(
                    "iptables-restore exited with code {}: {}",
                    output.exit_code,
                    output.output.trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallEnforcer for IptablesEnforcer {
    fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn active_chain(&self) -> ActiveChain {
        *self.chain.lock().await
    }

    async fn initialize_rules(&self) -> EnclaveResult<()> {
        let mut chain = self.chain.lock().await;
        if *chain != ActiveChain::Uninitialized {
            return Ok(());
        }

        self.restore(&init_rules()).await?;
        *chain = ActiveChain::Active(Chain::A);
        info!(service = %self.service_id, container = %self.container_id, "Initialized firewall chains");
        Ok(())
    }

    async fn update_rules(&self, blocked_ips: &[Ipv4Addr]) -> EnclaveResult<()> {
        let mut chain = self.chain.lock().await;
        let ActiveChain::Active(current) = *chain else {
            return Err(EnclaveError::Firewall {
                service: self.service_id.to_string(),
                message: "cannot update rules before they are initialized".into(),
            });
        };

        let next = current.other();
        self.restore(&update_rules(current, next, blocked_ips)).await?;
        *chain = ActiveChain::Active(next);
        info!(
            service = %self.service_id,
            chain = %next,
            blocked = blocked_ips.len(),
            "Updated firewall rules"
        );
        Ok(())
    }
}

/// `iptables-restore` input creating both chains and hooking chain A
pub fn init_rules() -> String {
    let mut rules = String::from("*filter\n");
    for chain in [Chain::A, Chain::B] {
        rules.push_str(&format!(":{} - [0:0]\n", chain));
    }
    for hook in ["INPUT", "OUTPUT"] {
        rules.push_str(&format!("-I {} 1 -j {}\n", hook, Chain::A));
    }
    rules.push_str("COMMIT\n");
    rules
}

/// `iptables-restore` input moving the hooks from `current` to a rebuilt `next`
pub fn update_rules(current: Chain, next: Chain, blocked_ips: &[Ipv4Addr]) -> String {
    let ips: BTreeSet<&Ipv4Addr> = blocked_ips.iter().collect();

    // Declaring a chain under --noflush flushes it
    let mut rules = format!("*filter\n:{} - [0:0]\n", next);
    for ip in &ips {
        rules.push_str(&format!("-A {} -s {} -j DROP\n", next, ip));
        rules.push_str(&format!("-A {} -d {} -j DROP\n", next, ip));
    }
    for hook in ["INPUT", "OUTPUT"] {
        rules.push_str(&format!("-R {} 1 -j {}\n", hook, next));
    }
    rules.push_str(&format!(":{} - [0:0]\n", current));
    rules.push_str("COMMIT\n");
    rules
}

/// Exec argv feeding `rules` to `iptables-restore --noflush`
pub fn restore_command(rules: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("iptables-restore --noflush <<'EOF'\n{}EOF\n", rules),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_engine::{ContainerSpec, FakeEngine, NetworkAttachment};

    async fn enforcer_with_engine() -> (IptablesEnforcer, FakeEngine) {
        let engine = FakeEngine::new();
        let spec = ContainerSpec::new("sidecar", "iproute2", NetworkAttachment::Container("svc".into()));
        let (id, _) = engine.create_and_start_container(&spec).await.unwrap();
        let enforcer = IptablesEnforcer::new(ServiceId::new("api"), id, Arc::new(engine.clone()));
        (enforcer, engine)
    }

    fn ips(raw: &[&str]) -> Vec<Ipv4Addr> {
        raw.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_init_rules() {
        let rules = init_rules();
        assert_eq!(
            rules,
            "*filter\n:ENCLAVE_A - [0:0]\n:ENCLAVE_B - [0:0]\n-I INPUT 1 -j ENCLAVE_A\n-I OUTPUT 1 -j ENCLAVE_A\nCOMMIT\n"
        );
    }

    #[test]
    fn test_update_rules_sorted_and_deduped() {
        let rules = update_rules(Chain::A, Chain::B, &ips(&["10.0.0.9", "10.0.0.3", "10.0.0.9"]));
        let lines: Vec<&str> = rules.lines().collect();
        assert_eq!(
            lines,
            vec![
                "*filter",
                ":ENCLAVE_B - [0:0]",
                "-A ENCLAVE_B -s 10.0.0.3 -j DROP",
                "-A ENCLAVE_B -d 10.0.0.3 -j DROP",
                "-A ENCLAVE_B -s 10.0.0.9 -j DROP",
                "-A ENCLAVE_B -d 10.0.0.9 -j DROP",
                "-R INPUT 1 -j ENCLAVE_B",
                "-R OUTPUT 1 -j ENCLAVE_B",
                ":ENCLAVE_A - [0:0]",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn test_update_with_nothing_blocked() {
        let rules = update_rules(Chain::B, Chain::A, &[]);
        assert!(!rules.contains("DROP"));
        assert!(rules.contains("-R INPUT 1 -j ENCLAVE_A"));
    }

    #[tokio::test]
    async fn test_update_before_init_fails() {
        let (enforcer, engine) = enforcer_with_engine().await;
        let err = enforcer.update_rules(&ips(&["10.0.0.2"])).await.unwrap_err();
        assert!(matches!(err, EnclaveError::Firewall { .. }));
        assert!(engine.exec_log().is_empty());
    }

    #[tokio::test]
    async fn test_chains_alternate() {
        let (enforcer, engine) = enforcer_with_engine().await;
        enforcer.initialize_rules().await.unwrap();
        enforcer.initialize_rules().await.unwrap();
        assert_eq!(enforcer.active_chain().await, ActiveChain::Active(Chain::A));
        assert_eq!(engine.exec_log().len(), 1);

        enforcer.update_rules(&ips(&["10.0.0.2"])).await.unwrap();
        assert_eq!(enforcer.active_chain().await, ActiveChain::Active(Chain::B));
        enforcer.update_rules(&[]).await.unwrap();
        assert_eq!(enforcer.active_chain().await, ActiveChain::Active(Chain::A));

        let log = engine.exec_log();
        assert_eq!(log.len(), 3);
        assert!(log[1].1[2].contains("-R INPUT 1 -j ENCLAVE_B"));
        assert!(log[2].1[2].contains("-R OUTPUT 1 -j ENCLAVE_A"));
    }

    #[tokio::test]
    async fn test_failed_update_keeps_old_chain() {
        let (enforcer, engine) = enforcer_with_engine().await;
        enforcer.initialize_rules().await.unwrap();

        engine.fail_exec_in("sidecar", "iptables-restore: line 3 failed");
        let err = enforcer.update_rules(&ips(&["10.0.0.2"])).await.unwrap_err();
        assert!(err.to_string().contains("line 3 failed"));
        assert_eq!(enforcer.active_chain().await, ActiveChain::Active(Chain::A));

        engine.clear_failures();
        enforcer.update_rules(&ips(&["10.0.0.2"])).await.unwrap();
        assert_eq!(enforcer.active_chain().await, ActiveChain::Active(Chain::B));
    }
}
