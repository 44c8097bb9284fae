//! In-process cluster used by tests
//!
//! Holds services and nodes in memory, applies status and label writes to the
//! stored objects the way the API server would, and journals every write so
//! tests can assert on API traffic.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service, ServiceStatus};
use kube::ResourceExt;
use tokio::sync::Notify;

use super::informer::object_key;
use super::{ClusterState, ServiceWriter, StatusWriteError};
use crate::annotations;
use crate::error::Result;

/// A write the controller sent to the cluster
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterWrite {
    Status {
        key: String,
        status: LoadBalancerStatus,
    },
    SetHash {
        key: String,
        hash: String,
    },
    RemoveHash {
        key: String,
    },
}

#[derive(Default)]
struct State {
    services: BTreeMap<String, Arc<Service>>,
    nodes: BTreeMap<String, Arc<Node>>,
    writes: Vec<ClusterWrite>,
    status_failures: VecDeque<StatusWriteError>,
    next_version: u64,
}

impl State {
    fn bump(&mut self, svc: &mut Service) {
        self.next_version += 1;
        svc.metadata.resource_version = Some(self.next_version.to_string());
    }
}

#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
    synced: Arc<AtomicBool>,
    ready: Arc<Notify>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            synced: Arc::new(AtomicBool::new(true)),
            ready: Arc::new(Notify::new()),
        }
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster whose caches report unsynced until [`mark_synced`](Self::mark_synced)
    pub fn unsynced() -> Self {
        let cluster = Self::default();
        cluster.synced.store(false, Ordering::SeqCst);
        cluster
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
        self.ready.notify_waiters();
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or replace a service, returning the stored copy
    pub fn upsert_service(&self, mut svc: Service) -> Arc<Service> {
        let mut state = self.state();
        state.bump(&mut svc);
        let svc = Arc::new(svc);
        state.services.insert(object_key(svc.as_ref()), svc.clone());
        svc
    }

    pub fn delete_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.state()
            .services
            .remove(&format!("{}/{}", namespace, name))
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.state()
            .services
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    pub fn upsert_node(&self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.state().nodes.insert(node.name_any(), node.clone());
        node
    }

    pub fn delete_node(&self, name: &str) -> Option<Arc<Node>> {
        self.state().nodes.remove(name)
    }

    /// Make the next status write fail with `err`
    pub fn fail_next_status(&self, err: StatusWriteError) {
        self.state().status_failures.push_back(err);
    }

    pub fn writes(&self) -> Vec<ClusterWrite> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }
}

#[async_trait]
impl ClusterState for MemoryCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>> {
        Ok(self.service(namespace, name))
    }

    async fn nodes(&self) -> Result<Vec<Arc<Node>>> {
        Ok(self.state().nodes.values().cloned().collect())
    }

    async fn fetch_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(namespace, name).map(|svc| svc.as_ref().clone()))
    }

    async fn wait_for_sync(&self) {
        loop {
            let notified = self.ready.notified();
            if self.is_synced() {
                return;
            }
            notified.await;
        }
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceWriter for MemoryCluster {
    async fn update_load_balancer_status(
        &self,
        svc: &Service,
        status: &LoadBalancerStatus,
    ) -> std::result::Result<(), StatusWriteError> {
        let key = object_key(svc);
        let mut state = self.state();
        state.writes.push(ClusterWrite::Status {
            key: key.clone(),
            status: status.clone(),
        });
        if let Some(err) = state.status_failures.pop_front() {
            return Err(err);
        }

        let Some(latest) = state.services.get(&key) else {
            return Err(StatusWriteError::NotFound);
        };
        let mut updated = latest.as_ref().clone();
        updated
            .status
            .get_or_insert_with(ServiceStatus::default)
            .load_balancer = Some(status.clone());
        state.bump(&mut updated);
        state.services.insert(key, Arc::new(updated));
        Ok(())
    }

    async fn set_hash_label(&self, svc: &Service, hash: &str) -> Result<()> {
        let key = object_key(svc);
        let mut state = self.state();
        state.writes.push(ClusterWrite::SetHash {
            key: key.clone(),
            hash: hash.to_string(),
        });
        if let Some(latest) = state.services.get(&key).cloned() {
            let mut updated = latest.as_ref().clone();
            updated
                .labels_mut()
                .insert(annotations::SERVICE_HASH_LABEL.to_string(), hash.to_string());
            state.bump(&mut updated);
            state.services.insert(key, Arc::new(updated));
        }
        Ok(())
    }

    async fn remove_hash_label(&self, svc: &Service) -> Result<()> {
        let key = object_key(svc);
        let mut state = self.state();
        state.writes.push(ClusterWrite::RemoveHash { key: key.clone() });
        if let Some(latest) = state.services.get(&key).cloned() {
            let mut updated = latest.as_ref().clone();
            updated.labels_mut().remove(annotations::SERVICE_HASH_LABEL);
            state.bump(&mut updated);
            state.services.insert(key, Arc::new(updated));
        }
        Ok(())
    }
}
