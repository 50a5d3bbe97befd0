//! Sidecar container bookkeeping

use crate::firewall::{FirewallEnforcer, IptablesEnforcer};
use enclave_common::labels::{CONTAINER_TYPE_LABEL, SERVICE_GUID_LABEL, SIDECAR_CONTAINER_TYPE};
use enclave_common::{EnclaveError, EnclaveResult, ServiceGuid, ServiceId};
use enclave_engine::{ContainerEngine, ContainerSpec, EngineResult, Labels, NetworkAttachment};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One firewall sidecar per started service
///
/// Not synchronized; the owning service network serializes access.
pub struct SidecarRegistry {
    engine: Arc<dyn ContainerEngine>,
    image: String,
    name_prefix: String,
    labels: Labels,
    sidecars: HashMap<ServiceId, Arc<dyn FirewallEnforcer>>,
}

impl SidecarRegistry {
    /// `labels` go on every sidecar container, next to the per-service ones
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        image: impl Into<String>,
        name_prefix: impl Into<String>,
        labels: Labels,
    ) -> Self {
        Self {
            engine,
            image: image.into(),
            name_prefix: name_prefix.into(),
            labels,
            sidecars: HashMap::new(),
        }
    }

    /// Start a sidecar in the network namespace of `service_container_id`
    ///
    /// The sidecar isn't tracked until [`SidecarRegistry::insert`]; until then
    /// its container belongs to the caller.
    pub async fn launch(
        &self,
        service_id: &ServiceId,
        guid: &ServiceGuid,
        service_container_id: &str,
    ) -> EnclaveResult<Arc<dyn FirewallEnforcer>> {
        if self.sidecars.contains_key(service_id) {
            return Err(EnclaveError::Validation(format!(
                "a sidecar already exists for service '{}'",
                service_id
            )));
        }

        let mut spec = ContainerSpec::new(
            format!("{}--sidecar--{}", self.name_prefix, guid),
            self.image.clone(),
            NetworkAttachment::Container(service_container_id.to_string()),
        );
        spec.cap_add.push("NET_ADMIN".into());
        // Commands arrive through exec; the container only has to stay up
        spec.cmd = Some(vec!["sleep".into(), "infinity".into()]);
        spec.labels = self.labels.clone();
        spec.labels.insert(CONTAINER_TYPE_LABEL.into(), SIDECAR_CONTAINER_TYPE.into());
        spec.labels.insert(SERVICE_GUID_LABEL.into(), guid.to_string());

        let (container_id, _) = self.engine.create_and_start_container(&spec).await?;
        info!(service = %service_id, sidecar = %container_id, "Started networking sidecar");

        Ok(Arc::new(IptablesEnforcer::new(
            service_id.clone(),
            container_id,
            self.engine.clone(),
        )))
    }

    /// Launch and track a sidecar in one step
    pub async fn add(
        &mut self,
        service_id: &ServiceId,
        guid: &ServiceGuid,
        service_container_id: &str,
    ) -> EnclaveResult<Arc<dyn FirewallEnforcer>> {
        let sidecar = self.launch(service_id, guid, service_container_id).await?;
        self.insert(service_id.clone(), sidecar.clone())?;
        Ok(sidecar)
    }

    /// Track a launched sidecar
    pub fn insert(&mut self, service_id: ServiceId, sidecar: Arc<dyn FirewallEnforcer>) -> EnclaveResult<()> {
        if self.sidecars.contains_key(&service_id) {
            return Err(EnclaveError::Validation(format!(
                "a sidecar already exists for service '{}'",
                service_id
            )));
        }
        self.sidecars.insert(service_id, sidecar);
        Ok(())
    }

    pub fn get(&self, service_id: &ServiceId) -> Option<Arc<dyn FirewallEnforcer>> {
        self.sidecars.get(service_id).cloned()
    }

    /// Kill and remove the sidecar of `service_id`, then forget it; no-op if there is none
    ///
    /// A container that is already gone counts as removed. On any other
    /// failure the entry stays, so the removal can be retried.
    pub async fn remove(&mut self, service_id: &ServiceId) -> EnclaveResult<()> {
        let Some(sidecar) = self.sidecars.get(service_id).cloned() else {
            return Ok(());
        };
        let container_id = sidecar.container_id();

        let teardown = async {
            tolerate_missing(self.engine.kill_container(container_id).await)?;
            tolerate_missing(self.engine.remove_container(container_id).await)
        };
        if let Err(e) = teardown.await {
            error!(
                "ACTION REQUIRED: failed to remove networking sidecar '{}' of service '{}' ({}); remove it manually",
                container_id, service_id, e
            );
            return Err(e.into());
        }

        self.sidecars.remove(service_id);
        info!(service = %service_id, sidecar = %container_id, "Removed networking sidecar");
        Ok(())
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.sidecars.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sidecars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sidecars.is_empty()
    }
}

fn tolerate_missing(result: EngineResult<()>) -> EngineResult<()> {
    match result {
        Err(e) if e.is_not_found() => {
            warn!(error = %e, "Networking sidecar already gone");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::ActiveChain;
    use enclave_engine::fake::ops;
    use enclave_engine::FakeEngine;

    fn registry(engine: &FakeEngine) -> SidecarRegistry {
        let labels = Labels::from([("enclave.id".to_string(), "test".to_string())]);
        SidecarRegistry::new(Arc::new(engine.clone()), "kurtosistech/iproute2", "test", labels)
    }

    async fn add(
        registry: &mut SidecarRegistry,
        id: &ServiceId,
        service_container_id: &str,
    ) -> Arc<dyn FirewallEnforcer> {
        registry
            .add(id, &ServiceGuid::generate(id), service_container_id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_launch_starts_sidecar_in_service_namespace() {
        let engine = FakeEngine::new();
        let registry = registry(&engine);
        let id = ServiceId::new("api");
        let guid = ServiceGuid::generate(&id);

        let sidecar = registry.launch(&id, &guid, "svc-container").await.unwrap();
        assert_eq!(sidecar.active_chain().await, ActiveChain::Uninitialized);
        assert!(registry.get(&id).is_none());

        let container = engine.container(sidecar.container_id()).unwrap();
        assert_eq!(container.spec.network, NetworkAttachment::Container("svc-container".into()));
        assert_eq!(container.spec.cap_add, vec!["NET_ADMIN".to_string()]);
        assert_eq!(container.spec.labels.get("enclave.id").map(String::as_str), Some("test"));
        assert_eq!(container.spec.labels.get(SERVICE_GUID_LABEL), Some(&guid.to_string()));
    }

    #[tokio::test]
    async fn test_second_sidecar_for_service_fails() {
        let engine = FakeEngine::new();
        let mut registry = registry(&engine);
        let id = ServiceId::new("api");
        let first = add(&mut registry, &id, "c1").await;

        assert!(matches!(
            registry.add(&id, &ServiceGuid::generate(&id), "c1").await,
            Err(EnclaveError::Validation(_))
        ));
        assert!(registry.insert(id.clone(), first).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_launch_registers_nothing() {
        let engine = FakeEngine::new();
        engine.fail(ops::START_CONTAINER, 1);
        let registry = registry(&engine);
        let id = ServiceId::new("api");

        assert!(registry.launch(&id, &ServiceGuid::generate(&id), "c1").await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let engine = FakeEngine::new();
        let mut registry = registry(&engine);
        let id = ServiceId::new("api");
        let sidecar = add(&mut registry, &id, "c1").await;

        registry.remove(&id).await.unwrap();
        registry.remove(&id).await.unwrap();
        assert!(registry.is_empty());
        assert!(engine.container(sidecar.container_id()).is_none());
    }

    #[tokio::test]
    async fn test_remove_tolerates_vanished_container() {
        let engine = FakeEngine::new();
        let mut registry = registry(&engine);
        let id = ServiceId::new("api");
        let sidecar = add(&mut registry, &id, "c1").await;
        engine.remove_container(sidecar.container_id()).await.unwrap();

        registry.remove(&id).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_entry_for_retry() {
        let engine = FakeEngine::new();
        let mut registry = registry(&engine);
        let id = ServiceId::new("api");
        let sidecar = add(&mut registry, &id, "c1").await;

        engine.fail(ops::KILL_CONTAINER, 1);
        assert!(registry.remove(&id).await.is_err());
        assert!(registry.get(&id).is_some());
        assert!(engine.container(sidecar.container_id()).unwrap().running);

        registry.remove(&id).await.unwrap();
        assert!(registry.is_empty());
        assert!(engine.container(sidecar.container_id()).is_none());
    }
}
