//! Process-local record of the last successfully reconciled service state
//!
//! A present entry means a load balancer matching that service is believed
//! to exist. Absence means the key was never converged, or it was removed
//! on purpose. The cache is an identity and change-detection aid only; all
//! truth is re-derived from the API server and the cloud on every sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use k8s_openapi::api::core::v1::{LoadBalancerStatus, Service};

use super::key::ServiceKey;

#[derive(Clone, Debug)]
pub struct CachedService {
    pub service: Arc<Service>,
    pub uid: Option<String>,
    /// Status returned by the last successful ensure
    pub status: LoadBalancerStatus,
    /// Hash of the spec and backend set last pushed to the cloud.
    /// `None` forces the next sync to call the backend again.
    pub fingerprint: Option<String>,
}

impl CachedService {
    /// Entry for a service seen only through a delete notification
    pub fn deleted(service: Arc<Service>) -> Self {
        Self {
            uid: service.metadata.uid.clone(),
            status: service
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.clone())
                .unwrap_or_default(),
            service,
            fingerprint: None,
        }
    }
}

/// Shared handle; clones see the same map
#[derive(Clone, Default)]
pub struct ServiceCache {
    inner: Arc<Mutex<HashMap<ServiceKey, CachedService>>>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<ServiceKey, CachedService>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &ServiceKey) -> Option<CachedService> {
        self.map().get(key).cloned()
    }

    pub fn set(&self, key: ServiceKey, entry: CachedService) {
        self.map().insert(key, entry);
    }

    pub fn remove(&self, key: &ServiceKey) -> Option<CachedService> {
        self.map().remove(key)
    }

    /// Forget the fingerprint so the next sync re-ensures the load balancer
    pub fn mark_stale(&self, key: &ServiceKey) {
        if let Some(entry) = self.map().get_mut(key) {
            entry.fingerprint = None;
        }
    }

    pub fn mark_all_stale(&self) {
        for entry in self.map().values_mut() {
            entry.fingerprint = None;
        }
    }

    /// Point-in-time copy of every tracked service
    pub fn services(&self) -> Vec<(ServiceKey, Arc<Service>)> {
        self.map()
            .iter()
            .map(|(k, v)| (k.clone(), v.service.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
