//! In-process load balancer provider
//!
//! Keeps load balancers in memory with the same identity rules a real
//! provider uses: balancers created for a service are named after its UID,
//! and a service may instead point at a pre-existing balancer through the
//! load-balancer-id annotation. Pre-existing balancers are never deleted,
//! only detached. Raw failures can be injected and are classified exactly
//! as provider responses would be.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use kube::ResourceExt;
use tracing::{debug, info};

use super::{
    additional_tags, load_balancer_name, user_load_balancer_id, CloudError, CloudErrorKind,
    CloudProvider, ErrorClassifier, LoadBalancerBackend, LoadBalancerDescriptor,
    PatternClassifier,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    pub port: i32,
    pub protocol: String,
    pub node_port: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryLoadBalancer {
    pub id: String,
    pub name: String,
    pub address: String,
    pub listeners: Vec<Listener>,
    /// Backend pool, by node name
    pub backends: Vec<String>,
    pub tags: BTreeMap<String, String>,
    /// Provisioned outside the controller and only borrowed by services
    pub user_managed: bool,
}

impl MemoryLoadBalancer {
    fn descriptor(&self) -> LoadBalancerDescriptor {
        LoadBalancerDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            user_managed: self.user_managed,
        }
    }

    fn status(&self) -> LoadBalancerStatus {
        LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some(self.address.clone()),
                ..Default::default()
            }]),
        }
    }
}

/// Journal entry for every backend call, keyed by service UID
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Exists { uid: String },
    Ensure { uid: String, nodes: Vec<String> },
    Delete { uid: String },
}

impl BackendCall {
    pub fn is_write(&self) -> bool {
        !matches!(self, BackendCall::Exists { .. })
    }
}

#[derive(Default)]
struct State {
    balancers: BTreeMap<String, MemoryLoadBalancer>,
    next_id: u32,
    failures: VecDeque<String>,
    calls: Vec<BackendCall>,
}

impl State {
    fn allocate(&mut self) -> (String, String) {
        self.next_id += 1;
        let n = self.next_id;
        (
            format!("lb-{:08x}", n),
            format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff),
        )
    }

    fn find(&self, service: &Service) -> Option<&MemoryLoadBalancer> {
        match user_load_balancer_id(service) {
            Some(id) => self.balancers.get(id),
            None => {
                let name = load_balancer_name(service);
                self.balancers.values().find(|lb| lb.name == name)
            }
        }
    }

    fn find_id(&self, service: &Service) -> Option<String> {
        self.find(service).map(|lb| lb.id.clone())
    }
}

pub struct MemoryBackend {
    state: Mutex<State>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Arc::new(PatternClassifier::default()))
    }
}

impl MemoryBackend {
    pub fn new(classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            classifier,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a balancer provisioned outside the controller, returning its id
    pub fn seed(&self, name: &str) -> String {
        let mut state = self.state();
        let (id, address) = state.allocate();
        state.balancers.insert(
            id.clone(),
            MemoryLoadBalancer {
                id: id.clone(),
                name: name.to_string(),
                address,
                listeners: Vec::new(),
                backends: Vec::new(),
                tags: BTreeMap::new(),
                user_managed: true,
            },
        );
        id
    }

    /// Fail the next call with a raw provider message
    pub fn inject_failure(&self, raw_message: impl Into<String>) {
        self.state().failures.push_back(raw_message.into());
    }

    pub fn get(&self, id: &str) -> Option<MemoryLoadBalancer> {
        self.state().balancers.get(id).cloned()
    }

    pub fn find_for(&self, service: &Service) -> Option<MemoryLoadBalancer> {
        self.state().find(service).cloned()
    }

    pub fn balancers(&self) -> Vec<MemoryLoadBalancer> {
        self.state().balancers.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn begin(&self, call: BackendCall) -> Result<MutexGuard<'_, State>, CloudError> {
        let mut state = self.state();
        state.calls.push(call);
        match state.failures.pop_front() {
            Some(raw) => Err(CloudError::classified(self.classifier.as_ref(), raw)),
            None => Ok(state),
        }
    }
}

fn uid_of(service: &Service) -> String {
    service.uid().unwrap_or_default()
}

fn listeners_for(service: &Service) -> Vec<Listener> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| Listener {
                    port: p.port,
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    node_port: p.node_port.unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl LoadBalancerBackend for MemoryBackend {
    async fn exists(&self, service: &Service) -> Result<Option<LoadBalancerDescriptor>, CloudError> {
        let state = self.begin(BackendCall::Exists {
            uid: uid_of(service),
        })?;
        Ok(state.find(service).map(MemoryLoadBalancer::descriptor))
    }

    async fn ensure_load_balancer(
        &self,
        service: &Service,
        nodes: &[Arc<Node>],
    ) -> Result<LoadBalancerStatus, CloudError> {
        let backends: Vec<String> = nodes.iter().map(|n| n.name_any()).collect();
        let mut state = self.begin(BackendCall::Ensure {
            uid: uid_of(service),
            nodes: backends.clone(),
        })?;

        let listeners = listeners_for(service);
        let tags = additional_tags(service.annotations());

        if let Some(id) = state.find_id(service) {
            let lb = state
                .balancers
                .get_mut(&id)
                .ok_or_else(|| CloudError::new(CloudErrorKind::NotFound, id.clone()))?;
            lb.listeners = listeners;
            lb.backends = backends;
            if !lb.user_managed {
                lb.tags = tags;
            }
            debug!("Updated load balancer {} ({})", lb.id, lb.name);
            return Ok(lb.status());
        }

        if let Some(id) = user_load_balancer_id(service) {
            return Err(CloudError::new(
                CloudErrorKind::Rejected,
                format!(
                    "ErrorCode: InvalidLoadBalancerId.NotFound Message: The specified LoadBalancerId {} does not exist.",
                    id
                ),
            ));
        }

        let (id, address) = state.allocate();
        let lb = MemoryLoadBalancer {
            id: id.clone(),
            name: load_balancer_name(service),
            address,
            listeners,
            backends,
            tags,
            user_managed: false,
        };
        info!(
            "Created load balancer {} ({}) for {}/{}",
            lb.id,
            lb.name,
            service.namespace().unwrap_or_default(),
            service.name_any()
        );
        let status = lb.status();
        state.balancers.insert(id, lb);
        Ok(status)
    }

    async fn ensure_load_balancer_deleted(&self, service: &Service) -> Result<(), CloudError> {
        let mut state = self.begin(BackendCall::Delete {
            uid: uid_of(service),
        })?;

        let Some(id) = state.find_id(service) else {
            return Ok(());
        };

        if user_load_balancer_id(service).is_some() {
            if let Some(lb) = state.balancers.get_mut(&id) {
                lb.listeners.clear();
                lb.backends.clear();
                info!("Detached service from reused load balancer {}", id);
            }
        } else {
            state.balancers.remove(&id);
            info!("Deleted load balancer {}", id);
        }
        Ok(())
    }
}

/// Cloud provider backed by [`MemoryBackend`]
pub struct MemoryCloud {
    backend: Option<Arc<MemoryBackend>>,
}

impl MemoryCloud {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// A provider that offers no load balancer capability
    pub fn without_load_balancer() -> Self {
        Self { backend: None }
    }
}

impl CloudProvider for MemoryCloud {
    fn name(&self) -> &str {
        "memory"
    }

    fn load_balancer(&self) -> Option<Arc<dyn LoadBalancerBackend>> {
        self.backend
            .clone()
            .map(|backend| backend as Arc<dyn LoadBalancerBackend>)
    }
}
