//! Tests for the reconciler module
//!
//! These tests drive [`Reconciler::sync`] against in-memory collaborators and
//! verify:
//! - Convergence and idempotence (no writes on an unchanged second run)
//! - UID change handling (delete, then ensure)
//! - Deletion with and without a cached object
//! - Status write outcomes (not found, conflict)
//! - Event emission on failure paths

#[cfg(test)]
mod tests {
    use super::super::cache::ServiceCache;
    use super::super::events::{
        EventType, MemoryRecorder, REASON_DELETED_LOAD_BALANCER,
        REASON_DELETE_LOAD_BALANCER_FAILED, REASON_ENSURED_LOAD_BALANCER,
        REASON_SYNC_LOAD_BALANCER_FAILED, REASON_UNAVAILABLE_LOAD_BALANCER,
    };
    use super::super::key::ServiceKey;
    use super::super::reconciler::Reconciler;
    use crate::annotations;
    use crate::cloud::memory::BackendCall;
    use crate::cloud::MemoryBackend;
    use crate::cluster::memory::ClusterWrite;
    use crate::cluster::{MemoryCluster, StatusWriteError};
    use crate::config::{ControllerConfig, RetryPolicy};
    use crate::error::Error;
    use k8s_openapi::api::core::v1::{
        Node, NodeCondition, NodeStatus, Service, ServicePort, ServiceSpec,
    };
    use kube::api::ObjectMeta;
    use kube::ResourceExt;
    use std::sync::Arc;

    struct Fixture {
        reconciler: Reconciler,
        cluster: MemoryCluster,
        backend: Arc<MemoryBackend>,
        recorder: MemoryRecorder,
        cache: ServiceCache,
    }

    fn fast_retry(steps: u32) -> RetryPolicy {
        RetryPolicy {
            initial_millis: 1,
            factor: 2.0,
            steps,
            jitter: 0.0,
        }
    }

    fn fixture() -> Fixture {
        let cluster = MemoryCluster::new();
        let backend = Arc::new(MemoryBackend::default());
        let recorder = MemoryRecorder::new();
        let cache = ServiceCache::new();
        let config = ControllerConfig {
            delete_retry: fast_retry(4),
            status_retry: fast_retry(3),
            ..Default::default()
        };
        let reconciler = Reconciler::new(
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            backend.clone(),
            Arc::new(recorder.clone()),
            cache.clone(),
            &config,
        );
        Fixture {
            reconciler,
            cluster,
            backend,
            recorder,
            cache,
        }
    }

    fn ready_node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn lb_service(uid: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    node_port: Some(30080),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn key() -> ServiceKey {
        ServiceKey::new("default", "web")
    }

    fn calls_for(backend: &MemoryBackend) -> Vec<String> {
        backend
            .calls()
            .into_iter()
            .map(|c| match c {
                BackendCall::Exists { uid } => format!("exists {}", uid),
                BackendCall::Ensure { uid, .. } => format!("ensure {}", uid),
                BackendCall::Delete { uid } => format!("delete {}", uid),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_sync_creates_load_balancer_and_publishes_status() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));

        f.reconciler.sync(&key()).await.unwrap();

        let balancers = f.backend.balancers();
        assert_eq!(balancers.len(), 1);
        assert_eq!(balancers[0].backends, vec!["n1".to_string()]);

        let live = f.cluster.service("default", "web").unwrap();
        let ingress = live
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .expect("status must be published");
        assert_eq!(ingress[0].ip.as_deref(), Some(balancers[0].address.as_str()));
        assert!(live.labels().contains_key(annotations::SERVICE_HASH_LABEL));

        let cached = f.cache.get(&key()).expect("success must be cached");
        assert_eq!(cached.uid.as_deref(), Some("u1"));
        assert!(f.recorder.reasons().contains(&REASON_ENSURED_LOAD_BALANCER.to_string()));
    }

    #[tokio::test]
    async fn test_second_sync_without_change_writes_nothing() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.reconciler.sync(&key()).await.unwrap();

        f.backend.clear_calls();
        f.cluster.clear_writes();
        f.reconciler.sync(&key()).await.unwrap();

        assert!(f.backend.calls().iter().all(|c| !c.is_write()));
        assert!(f.cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn test_stale_entry_re_ensures_without_status_write() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.reconciler.sync(&key()).await.unwrap();

        f.backend.clear_calls();
        f.cluster.clear_writes();
        f.cache.mark_stale(&key());
        f.reconciler.sync(&key()).await.unwrap();

        assert_eq!(calls_for(&f.backend), vec!["ensure u1"]);
        assert!(f.cluster.writes().is_empty());
    }

    #[tokio::test]
    async fn test_node_change_updates_backend_pool() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.reconciler.sync(&key()).await.unwrap();

        f.cluster.upsert_node(ready_node("n2"));
        f.reconciler.sync(&key()).await.unwrap();

        let lb = f.backend.balancers().remove(0);
        assert_eq!(lb.backends, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[tokio::test]
    async fn test_uid_change_deletes_before_ensuring() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.reconciler.sync(&key()).await.unwrap();

        f.backend.clear_calls();
        f.cluster.upsert_service(lb_service("u2"));
        f.reconciler.sync(&key()).await.unwrap();

        assert_eq!(calls_for(&f.backend), vec!["delete u2", "ensure u2"]);
        assert_eq!(f.cache.get(&key()).unwrap().uid.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn test_deletion_without_cache_is_a_noop() {
        let f = fixture();
        f.reconciler.sync(&key()).await.unwrap();
        assert!(f.backend.calls().is_empty());
        assert!(f.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_service_tears_down_load_balancer() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.reconciler.sync(&key()).await.unwrap();

        f.cluster.delete_service("default", "web");
        f.reconciler.sync(&key()).await.unwrap();

        assert!(f.backend.balancers().is_empty());
        assert!(f.cache.get(&key()).is_none());
        assert!(f.recorder.reasons().contains(&REASON_DELETED_LOAD_BALANCER.to_string()));
    }

    #[tokio::test]
    async fn test_delete_failure_is_retried() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.reconciler.sync(&key()).await.unwrap();

        f.cluster.delete_service("default", "web");
        f.backend
            .inject_failure("ErrorCode: ServiceUnavailable Message: The request has failed due to a temporary failure.");
        f.reconciler.sync(&key()).await.unwrap();

        let reasons = f.recorder.reasons();
        assert!(reasons.contains(&REASON_DELETE_LOAD_BALANCER_FAILED.to_string()));
        assert!(reasons.contains(&REASON_DELETED_LOAD_BALANCER.to_string()));
        assert!(f.backend.balancers().is_empty());
    }

    #[tokio::test]
    async fn test_no_longer_load_balancer_cleans_up() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.reconciler.sync(&key()).await.unwrap();

        let mut plain = f.cluster.service("default", "web").unwrap().as_ref().clone();
        if let Some(spec) = plain.spec.as_mut() {
            spec.type_ = Some("ClusterIP".to_string());
        }
        f.cluster.upsert_service(plain);
        f.backend.clear_calls();
        f.cluster.clear_writes();

        f.reconciler.sync(&key()).await.unwrap();

        assert_eq!(calls_for(&f.backend), vec!["exists u1", "delete u1"]);
        assert!(f.backend.balancers().is_empty());
        assert!(f.cache.get(&key()).is_none());

        let writes = f.cluster.writes();
        assert!(writes.contains(&ClusterWrite::RemoveHash {
            key: "default/web".to_string()
        }));
        assert!(writes.iter().any(|w| matches!(
            w,
            ClusterWrite::Status { status, .. } if status.ingress.is_none()
        )));
    }

    #[tokio::test]
    async fn test_status_not_found_is_accepted() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.cluster.fail_next_status(StatusWriteError::NotFound);

        f.reconciler.sync(&key()).await.unwrap();
        assert!(f.cache.get(&key()).is_some());
    }

    #[tokio::test]
    async fn test_status_conflict_aborts_cycle() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.cluster.fail_next_status(StatusWriteError::Conflict);

        let err = f.reconciler.sync(&key()).await.unwrap_err();
        assert!(matches!(err, Error::StatusConflict(_)));
        assert!(f.cache.get(&key()).is_none());

        let status_writes = f
            .cluster
            .writes()
            .into_iter()
            .filter(|w| matches!(w, ClusterWrite::Status { .. }))
            .count();
        assert_eq!(status_writes, 1, "a conflict must not be retried");
    }

    #[tokio::test]
    async fn test_status_failure_is_retried() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.cluster
            .fail_next_status(StatusWriteError::Failed(Error::TryAgain("etcd".to_string())));

        f.reconciler.sync(&key()).await.unwrap();
        assert!(f.cache.get(&key()).is_some());
    }

    #[tokio::test]
    async fn test_ensure_failure_emits_sanitized_warning() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.backend.inject_failure(
            "ErrorCode: InvalidParameter RequestId: 4F2E Message: The listener port is invalid.",
        );

        let err = f.reconciler.sync(&key()).await.unwrap_err();
        assert!(matches!(err, Error::EnsureFailed { .. }));
        assert!(!err.is_throttled());
        assert!(f.cache.get(&key()).is_none());

        let events = f.recorder.events();
        let failure = events
            .iter()
            .find(|e| e.reason == REASON_SYNC_LOAD_BALANCER_FAILED)
            .expect("failure event");
        assert_eq!(failure.type_, EventType::Warning);
        assert_eq!(
            failure.message,
            "Error syncing load balancer: Message: The listener port is invalid."
        );
    }

    #[tokio::test]
    async fn test_throttled_ensure_is_classified() {
        let f = fixture();
        f.cluster.upsert_node(ready_node("n1"));
        f.cluster.upsert_service(lb_service("u1"));
        f.backend
            .inject_failure("ErrorCode: Throttling.User Message: Request was denied due to user flow control.");

        let err = f.reconciler.sync(&key()).await.unwrap_err();
        assert!(err.is_throttled());
    }

    #[tokio::test]
    async fn test_empty_backend_set_warns_but_ensures() {
        let f = fixture();
        f.cluster.upsert_service(lb_service("u1"));

        f.reconciler.sync(&key()).await.unwrap();

        assert!(f
            .recorder
            .reasons()
            .contains(&REASON_UNAVAILABLE_LOAD_BALANCER.to_string()));
        assert_eq!(f.backend.balancers().len(), 1);
        assert!(f.backend.balancers()[0].backends.is_empty());
    }

    #[tokio::test]
    async fn test_missing_uid_is_an_invariant_error() {
        let f = fixture();
        let mut svc = lb_service("u1");
        svc.metadata.uid = None;
        f.cluster.upsert_service(svc);

        let err = f.reconciler.sync(&key()).await.unwrap_err();
        assert!(matches!(err, Error::InvariantError(_)));
        assert!(f.backend.calls().is_empty());
    }
}
