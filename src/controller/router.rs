//! Watch deltas to work queue keys
//!
//! Each handler decides whether a change can affect some service's load
//! balancer and, if so, enqueues that service's key. Reconciliation always
//! re-reads current state, so the router only has to be conservative, never
//! exact.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::cache::{CachedService, ServiceCache};
use super::eligibility::is_excluded_node;
use super::events::{EventRecorder, EventType, REASON_TYPE};
use super::key::ServiceKey;
use super::predicates::{
    endpoints_changed, is_process_needed, need_add, needs_load_balancer, node_spec_changed,
    service_change, ServiceChange,
};
use super::queue::WorkQueue;
use crate::cluster::{ClusterState, EventHandler, ResourceEvent};

pub struct EventRouter {
    queue: WorkQueue<ServiceKey>,
    cache: ServiceCache,
    cluster: Arc<dyn ClusterState>,
    recorder: Arc<dyn EventRecorder>,
}

impl EventRouter {
    pub fn new(
        queue: WorkQueue<ServiceKey>,
        cache: ServiceCache,
        cluster: Arc<dyn ClusterState>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            queue,
            cache,
            cluster,
            recorder,
        }
    }

    fn enqueue(&self, svc: &Service) {
        if !is_process_needed(svc) {
            debug!(service = %svc.name_any(), "Class not empty, skip process");
            return;
        }
        let key = ServiceKey::from_service(svc);
        debug!(key = %key, "Enqueue service");
        self.queue.add(key);
    }

    pub fn on_service(&self, event: ResourceEvent<Service>) {
        match event {
            ResourceEvent::Added(svc) => {
                if need_add(&svc) {
                    info!(key = %ServiceKey::from_service(&svc), "Service addition event");
                    self.enqueue(&svc);
                }
            }
            ResourceEvent::Updated { old, new } => match service_change(&old, &new) {
                ServiceChange::Ignore => {}
                ServiceChange::TypeChanged(from, to) => {
                    if is_process_needed(&new) {
                        self.recorder.record(
                            new.object_ref(&()),
                            EventType::Normal,
                            REASON_TYPE,
                            format!("{} -> {}", from, to),
                        );
                    }
                    self.enqueue(&new);
                }
                ServiceChange::Sync => {
                    info!(key = %ServiceKey::from_service(&new), "Service update event");
                    self.enqueue(&new);
                }
            },
            ResourceEvent::Deleted(svc) => {
                if !need_add(&svc) || !is_process_needed(&svc) {
                    return;
                }
                let key = ServiceKey::from_service(&svc);
                info!(key = %key, "Service deletion received");
                // the object is unobservable from here on; keep it for the delete path
                self.cache.set(key.clone(), CachedService::deleted(svc));
                self.queue.add(key);
            }
        }
    }

    pub fn on_node(&self, event: ResourceEvent<Node>) {
        let node = match event {
            ResourceEvent::Added(node) | ResourceEvent::Deleted(node) => {
                if is_excluded_node(&node) {
                    debug!(node = %node.name_any(), "Node is excluded from load balancing, skip");
                    return;
                }
                node
            }
            ResourceEvent::Updated { old, new } => {
                if is_excluded_node(&old) && is_excluded_node(&new) {
                    return;
                }
                if !node_spec_changed(&old, &new) {
                    return;
                }
                info!(node = %new.name_any(), "Node update event");
                new
            }
        };

        let mut queued = 0;
        for (key, svc) in self.cache.services() {
            if needs_load_balancer(&svc) && is_process_needed(&svc) {
                self.queue.add(key);
                queued += 1;
            }
        }
        debug!(node = %node.name_any(), "Node change enqueued {} services", queued);
    }

    pub async fn on_endpoints(&self, event: ResourceEvent<Endpoints>) {
        let endpoints = match event {
            ResourceEvent::Added(ep) | ResourceEvent::Deleted(ep) => ep,
            ResourceEvent::Updated { old, new } => {
                if !endpoints_changed(&old, &new) {
                    return;
                }
                new
            }
        };

        let key = ServiceKey::new(
            endpoints.namespace().unwrap_or_default(),
            endpoints.name_any(),
        );
        let svc = match self.cache.get(&key) {
            Some(cached) => cached.service,
            None => {
                debug!(key = %key, "No cached service for endpoints, fetching");
                match self.cluster.fetch_service(&key.namespace, &key.name).await {
                    Ok(Some(svc)) => Arc::new(svc),
                    Ok(None) => return,
                    Err(e) => {
                        warn!(key = %key, "Can not get service for endpoints: {}", e);
                        return;
                    }
                }
            }
        };

        if !is_process_needed(&svc) || !needs_load_balancer(&svc) {
            return;
        }

        let addresses: Vec<String> = endpoints
            .subsets
            .iter()
            .flatten()
            .flat_map(|s| s.addresses.iter().flatten())
            .map(|a| format!("{}@{}", a.ip, a.node_name.as_deref().unwrap_or("")))
            .collect();
        debug!(key = %key, "Enqueue for endpoints {:?}", addresses);

        self.cache.mark_stale(&key);
        self.queue.add(key);
    }
}

#[async_trait]
impl EventHandler<Service> for EventRouter {
    async fn handle(&self, event: ResourceEvent<Service>) {
        self.on_service(event);
    }
}

#[async_trait]
impl EventHandler<Node> for EventRouter {
    async fn handle(&self, event: ResourceEvent<Node>) {
        self.on_node(event);
    }
}

#[async_trait]
impl EventHandler<Endpoints> for EventRouter {
    async fn handle(&self, event: ResourceEvent<Endpoints>) {
        self.on_endpoints(event).await;
    }
}
