//! Subcluster manager (§3 `Subcluster`, §6 `PlatformServices`): groups of
//! vats launched and terminated together. The kernel tracks membership;
//! actually starting or killing a vat's sandbox is `PlatformServices`' job.

use crate::error::{KernelError, Result};
use crate::ids::{EndpointId, SubclusterId};
use crate::model::Subcluster;
use crate::platform::{PlatformServices, SubclusterConfig, VatConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct SubclusterManager {
    platform: Arc<dyn PlatformServices>,
    next_id: AtomicU64,
    subclusters: Mutex<HashMap<SubclusterId, Subcluster>>,
}

impl SubclusterManager {
    pub fn new(platform: Arc<dyn PlatformServices>) -> Self {
        SubclusterManager { platform, next_id: AtomicU64::new(1), subclusters: Mutex::new(HashMap::new()) }
    }

    /// Launches every vat in `config`, assigning each the next free
    /// `EndpointId::Vat` in `vat_ids`. Rolls back (terminates) any vat
    /// already launched if a later one fails, so a partially-launched
    /// subcluster never lingers.
    pub async fn launch(&self, config: SubclusterConfig, vat_ids: Vec<EndpointId>) -> Result<SubclusterId> {
        if vat_ids.len() != config.vats.len() {
            return Err(KernelError::StateViolation(format!(
                "subcluster {} needs {} vat ids, got {}",
                config.name,
                config.vats.len(),
                vat_ids.len()
            )));
        }

        let mut launched = Vec::with_capacity(vat_ids.len());
        for ((_name, vat_config), endpoint) in config.vats.iter().zip(vat_ids.iter().copied()) {
            if let Err(e) = self.platform.launch(endpoint, vat_config.clone()).await {
                for already in &launched {
                    let _ = self.platform.terminate(*already).await;
                }
                return Err(e);
            }
            launched.push(endpoint);
        }

        let id = SubclusterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subclusters.lock().unwrap().insert(id, Subcluster { id, config, vats: launched });
        Ok(id)
    }

    /// Terminates every vat in the subcluster and forgets it. Idempotent:
    /// terminating an unknown id is a no-op rather than an error, since a
    /// crank-fatal reap may have already torn a vat's endpoint down.
    pub async fn terminate(&self, id: SubclusterId) -> Result<()> {
        let subcluster = self.subclusters.lock().unwrap().remove(&id);
        let Some(subcluster) = subcluster else { return Ok(()) };
        for vat in subcluster.vats {
            self.platform.terminate(vat).await?;
        }
        Ok(())
    }

    pub fn get(&self, id: SubclusterId) -> Option<Subcluster> {
        self.subclusters.lock().unwrap().get(&id).cloned()
    }

    pub fn vat_config<'a>(config: &'a SubclusterConfig, name: &str) -> Option<&'a VatConfig> {
        config.vats.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakePlatform {
        launched: StdMutex<Vec<EndpointId>>,
        terminated: StdMutex<Vec<EndpointId>>,
        fail_on: Option<EndpointId>,
    }

    #[async_trait]
    impl PlatformServices for FakePlatform {
        async fn launch(&self, endpoint: EndpointId, _config: VatConfig) -> Result<()> {
            if self.fail_on == Some(endpoint) {
                return Err(KernelError::StateViolation("launch failed".into()));
            }
            self.launched.lock().unwrap().push(endpoint);
            Ok(())
        }
        async fn terminate(&self, endpoint: EndpointId) -> Result<()> {
            self.terminated.lock().unwrap().push(endpoint);
            Ok(())
        }
        async fn terminate_all(&self) -> Result<()> {
            Ok(())
        }
        async fn send_remote_message(&self, _remote: EndpointId, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn initialize_remote_comms(&self, _remote: EndpointId) -> Result<()> {
            Ok(())
        }
    }

    fn config(names: &[&str]) -> SubclusterConfig {
        let mut vats = std::collections::BTreeMap::new();
        for name in names {
            vats.insert(
                name.to_string(),
                VatConfig {
                    source: crate::platform::VatSource::BundleName("demo".into()),
                    creation_options: serde_json::Value::Null,
                    parameters: serde_json::Value::Null,
                    platform_config: serde_json::Value::Null,
                },
            );
        }
        SubclusterConfig { name: "group".into(), vats }
    }

    #[tokio::test]
    async fn launch_then_terminate_round_trips_membership() {
        let platform =
            Arc::new(FakePlatform { launched: StdMutex::new(Vec::new()), terminated: StdMutex::new(Vec::new()), fail_on: None });
        let manager = SubclusterManager::new(platform.clone());

        let id = manager.launch(config(&["a", "b"]), vec![EndpointId::Vat(1), EndpointId::Vat(2)]).await.unwrap();
        assert_eq!(platform.launched.lock().unwrap().len(), 2);
        assert!(manager.get(id).is_some());

        manager.terminate(id).await.unwrap();
        assert_eq!(platform.terminated.lock().unwrap().len(), 2);
        assert!(manager.get(id).is_none());
    }

    #[tokio::test]
    async fn failed_launch_rolls_back_already_launched_vats() {
        let platform = Arc::new(FakePlatform {
            launched: StdMutex::new(Vec::new()),
            terminated: StdMutex::new(Vec::new()),
            fail_on: Some(EndpointId::Vat(2)),
        });
        let manager = SubclusterManager::new(platform.clone());

        let err = manager.launch(config(&["a", "b"]), vec![EndpointId::Vat(1), EndpointId::Vat(2)]).await;
        assert!(err.is_err());
        assert_eq!(platform.launched.lock().unwrap().as_slice(), &[EndpointId::Vat(1)]);
        assert_eq!(platform.terminated.lock().unwrap().as_slice(), &[EndpointId::Vat(1)]);
    }

    #[tokio::test]
    async fn terminating_unknown_subcluster_is_a_no_op() {
        let platform =
            Arc::new(FakePlatform { launched: StdMutex::new(Vec::new()), terminated: StdMutex::new(Vec::new()), fail_on: None });
        let manager = SubclusterManager::new(platform);
        manager.terminate(SubclusterId(99)).await.unwrap();
    }
}
