//! Kill-on-drop guard for containers that aren't committed yet

use enclave_engine::ContainerEngine;
use std::sync::Arc;
use tracing::{error, warn};

/// Owns containers until [`ContainerCleanup::disarm`]
///
/// [`ContainerCleanup::run`] kills and removes them in place. Dropping an
/// armed guard (e.g. the owning future was cancelled) does the same on a
/// background task. Removal frees the names for a retry.
pub struct ContainerCleanup {
    engine: Arc<dyn ContainerEngine>,
    container_ids: Vec<String>,
    armed: bool,
}

impl ContainerCleanup {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            container_ids: Vec::new(),
            armed: true,
        }
    }

    pub fn track(&mut self, container_id: impl Into<String>) {
        self.container_ids.push(container_id.into());
    }

    /// Keep the containers
    pub fn disarm(mut self) {
        self.armed = false;
    }

    /// Kill and remove every tracked container, newest first; returns what couldn't be cleaned up
    pub async fn run(mut self) -> Vec<String> {
        self.armed = false;
        let ids = std::mem::take(&mut self.container_ids);
        kill_all(self.engine.clone(), ids).await
    }
}

impl Drop for ContainerCleanup {
    fn drop(&mut self) {
        if !self.armed || self.container_ids.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.container_ids);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(containers = ?ids, "Operation abandoned, killing its containers in the background");
                handle.spawn(kill_all(self.engine.clone(), ids));
            }
            Err(_) => {
                for id in ids {
                    error!("ACTION REQUIRED: no runtime to clean up with; manually kill container '{}'", id);
                }
            }
        }
    }
}

async fn kill_all(engine: Arc<dyn ContainerEngine>, mut ids: Vec<String>) -> Vec<String> {
    let mut failures = Vec::new();
    ids.reverse();
    for id in ids {
        if let Err(e) = engine.kill_container(&id).await {
            error!("ACTION REQUIRED: failed to kill container '{}' ({}); manually kill it", id, e);
            failures.push(format!("kill container '{}': {}", id, e));
            continue;
        }
        if let Err(e) = engine.remove_container(&id).await {
            error!("ACTION REQUIRED: failed to remove container '{}' ({}); manually remove it", id, e);
            failures.push(format!("remove container '{}': {}", id, e));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_engine::fake::ops;
    use enclave_engine::{ContainerSpec, FakeEngine, NetworkAttachment};

    async fn start(engine: &FakeEngine, name: &str) -> String {
        let spec = ContainerSpec::new(name, "busybox", NetworkAttachment::Container("x".into()));
        engine.create_and_start_container(&spec).await.unwrap().0
    }

    #[tokio::test]
    async fn test_disarmed_guard_keeps_containers() {
        let engine = FakeEngine::new();
        let id = start(&engine, "a").await;
        let mut cleanup = ContainerCleanup::new(Arc::new(engine.clone()));
        cleanup.track(&id);
        cleanup.disarm();
        assert!(engine.container(&id).unwrap().running);
    }

    #[tokio::test]
    async fn test_run_reports_failures() {
        let engine = FakeEngine::new();
        let a = start(&engine, "a").await;
        let b = start(&engine, "b").await;
        let mut cleanup = ContainerCleanup::new(Arc::new(engine.clone()));
        cleanup.track(&a);
        cleanup.track(&b);

        engine.fail(ops::KILL_CONTAINER, 1);
        let failures = cleanup.run().await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains(&b));
        assert!(engine.container(&a).is_none());
        assert!(engine.container(&b).unwrap().running);
    }

    #[tokio::test]
    async fn test_drop_kills_in_background() {
        let engine = FakeEngine::new();
        let id = start(&engine, "a").await;
        {
            let mut cleanup = ContainerCleanup::new(Arc::new(engine.clone()));
            cleanup.track(&id);
        }
        for _ in 0..50 {
            if engine.container(&id).is_none() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("container was not cleaned up");
    }
}
