//! Best-effort Kubernetes event emission
//!
//! Events are how service owners learn about load balancer failures. Recording
//! never blocks the caller and a failed write is only logged.

use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::Client;
use tracing::{info, warn};

pub use kube::runtime::events::EventType;

pub const REPORTING_COMPONENT: &str = "service-controller";

pub const REASON_UNAVAILABLE_LOAD_BALANCER: &str = "UnAvailableLoadBalancer";
pub const REASON_ENSURED_LOAD_BALANCER: &str = "EnsuredLoadBalancer";
pub const REASON_SYNC_LOAD_BALANCER_FAILED: &str = "SyncLoadBalancerFailed";
pub const REASON_DELETE_LOAD_BALANCER_FAILED: &str = "DeleteLoadBalancerFailed";
pub const REASON_DELETED_LOAD_BALANCER: &str = "DeletedLoadBalancer";
pub const REASON_TYPE: &str = "Type";

/// Sink for user-visible events attached to a Service or Node
pub trait EventRecorder: Send + Sync {
    fn record(&self, object: ObjectReference, type_: EventType, reason: &str, message: String);
}

/// Publishes core Events through `kube`'s recorder from a detached task
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        let instance = hostname::get().ok().and_then(|h| h.into_string().ok());
        Self {
            client,
            reporter: Reporter {
                controller: REPORTING_COMPONENT.to_string(),
                instance,
            },
        }
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, object: ObjectReference, type_: EventType, reason: &str, message: String) {
        let subject = object.name.clone().unwrap_or_default();
        match type_ {
            EventType::Normal => info!(object = %subject, reason, "{}", message),
            EventType::Warning => warn!(object = %subject, reason, "{}", message),
        }

        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object);
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: reason.to_string(),
            secondary: None,
        };
        tokio::spawn(async move {
            let reason = event.reason.clone();
            if let Err(e) = recorder.publish(event).await {
                warn!(object = %subject, "Failed to record {} event: {}", reason, e);
            }
        });
    }
}

/// One event captured by [`MemoryRecorder`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

/// Recorder that keeps events in memory, for tests and dry runs
#[derive(Clone, Default)]
pub struct MemoryRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, object: ObjectReference, type_: EventType, reason: &str, message: String) {
        let object = match (object.namespace, object.name) {
            (Some(ns), Some(name)) => format!("{}/{}", ns, name),
            (None, Some(name)) => name,
            _ => String::new(),
        };
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedEvent {
                object,
                type_,
                reason: reason.to_string(),
                message,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_recorder_keeps_kube_event_types() {
        let recorder = MemoryRecorder::new();
        recorder.record(
            ObjectReference {
                namespace: Some("default".to_string()),
                name: Some("web".to_string()),
                ..Default::default()
            },
            EventType::Warning,
            REASON_SYNC_LOAD_BALANCER_FAILED,
            "Error syncing load balancer: quota".to_string(),
        );
        recorder.record(
            ObjectReference {
                name: Some("node-1".to_string()),
                ..Default::default()
            },
            EventType::Normal,
            REASON_TYPE,
            "ClusterIP -> LoadBalancer".to_string(),
        );

        let events = recorder.events();
        assert_eq!(events[0].object, "default/web");
        assert_eq!(events[0].type_, EventType::Warning);
        assert_eq!(events[1].object, "node-1");
        assert_eq!(
            recorder.reasons(),
            vec![REASON_SYNC_LOAD_BALANCER_FAILED, REASON_TYPE]
        );
    }
}
