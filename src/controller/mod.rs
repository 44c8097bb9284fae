//! Service load balancer controller
//! This module contains the event routing, work queue, reconciliation state
//! machine and worker loop that keep cloud load balancers in line with
//! Services of type LoadBalancer.

pub mod backoff;
pub mod cache;
pub mod eligibility;
mod engine;
pub mod events;
pub mod key;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod predicates;
pub mod queue;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
mod router;
mod worker;

pub use backoff::{retry, RequeueBackoff, SharedBackoff};
pub use cache::{CachedService, ServiceCache};
pub use engine::{ServiceController, QUEUE_NAME};
pub use events::{EventRecorder, EventType, KubeEventRecorder, MemoryRecorder, RecordedEvent};
pub use key::ServiceKey;
pub use queue::WorkQueue;
pub use reconciler::Reconciler;
pub use router::EventRouter;
pub use worker::Worker;
