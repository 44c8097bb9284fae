//! Change predicates and content hashes
//!
//! Pure functions deciding whether a watched change can affect a service's
//! load balancer, plus the hashes used to detect that nothing changed.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Endpoints, LoadBalancerIngress, LoadBalancerStatus, Node, Service,
};
use kube::ResourceExt;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::annotations;
use crate::error::Result;

pub const SERVICE_TYPE_LOAD_BALANCER: &str = "LoadBalancer";

fn service_type(svc: &Service) -> Option<&str> {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref())
}

/// False when another controller claimed the service through the class annotation
pub fn is_process_needed(svc: &Service) -> bool {
    svc.annotations()
        .get(annotations::SERVICE_CLASS)
        .map(|class| class.is_empty())
        .unwrap_or(true)
}

/// The service wants a cloud load balancer right now
pub fn needs_load_balancer(svc: &Service) -> bool {
    service_type(svc) == Some(SERVICE_TYPE_LOAD_BALANCER)
        && svc.metadata.deletion_timestamp.is_none()
}

fn has_ingress(svc: &Service) -> bool {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|i| !i.is_empty())
        .unwrap_or(false)
}

/// The controller touched this service before (hash label or published ingress)
pub fn was_managed(svc: &Service) -> bool {
    svc.labels().contains_key(annotations::SERVICE_HASH_LABEL) || has_ingress(svc)
}

/// Service additions worth a sync: load balancer services, or ones
/// transitioning away from a load balancer we may still own
pub fn need_add(svc: &Service) -> bool {
    service_type(svc) == Some(SERVICE_TYPE_LOAD_BALANCER) || was_managed(svc)
}

/// Outcome of comparing two versions of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceChange {
    /// Nothing load-balancer relevant changed
    Ignore,
    Sync,
    /// `spec.type` changed; carries `(old, new)`
    TypeChanged(String, String),
}

/// Semantic diff between two versions of a service
pub fn service_change(old: &Service, new: &Service) -> ServiceChange {
    if !need_add(old) && !need_add(new) {
        return ServiceChange::Ignore;
    }

    let old_type = service_type(old).unwrap_or_default();
    let new_type = service_type(new).unwrap_or_default();
    if old_type != new_type {
        return ServiceChange::TypeChanged(old_type.to_string(), new_type.to_string());
    }

    let changed = old.spec != new.spec
        || old.annotations() != new.annotations()
        || old.metadata.uid != new.metadata.uid
        || old.metadata.deletion_timestamp.is_some() != new.metadata.deletion_timestamp.is_some();
    if changed {
        ServiceChange::Sync
    } else {
        ServiceChange::Ignore
    }
}

fn ready_status(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status.as_str())
}

/// Node updates that can change backend eligibility: labels, schedulability, readiness
pub fn node_spec_changed(old: &Node, new: &Node) -> bool {
    let unschedulable = |n: &Node| n.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
    old.labels() != new.labels()
        || unschedulable(old) != unschedulable(new)
        || ready_status(old) != ready_status(new)
}

/// Endpoint updates that change subset membership
pub fn endpoints_changed(old: &Endpoints, new: &Endpoints) -> bool {
    old.subsets != new.subsets
}

fn normalized(status: &LoadBalancerStatus) -> &[LoadBalancerIngress] {
    status.ingress.as_deref().unwrap_or_default()
}

/// Semantic equality of two load balancer statuses; absent and empty ingress lists match
pub fn load_balancer_status_equal(a: &LoadBalancerStatus, b: &LoadBalancerStatus) -> bool {
    normalized(a) == normalized(b)
}

fn digest(value: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let hash = Sha256::digest(&bytes);
    let mut hex = format!("{:x}", hash);
    // label values are limited to 63 characters
    hex.truncate(40);
    Ok(hex)
}

/// Content hash of the load-balancer relevant parts of a service
pub fn service_hash(svc: &Service) -> Result<String> {
    digest(&json!({
        "spec": svc.spec,
        "annotations": svc.annotations(),
    }))
}

/// Hash of everything pushed to the cloud on ensure: service content plus backend set
pub fn ensure_fingerprint(svc: &Service, nodes: &[Arc<Node>]) -> Result<String> {
    let mut names: Vec<String> = nodes.iter().map(|n| n.name_any()).collect();
    names.sort();
    digest(&json!({
        "service": service_hash(svc)?,
        "nodes": names,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointSubset, NodeCondition, NodeStatus, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn lb_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("u1".to_string()),
                annotations: Some(BTreeMap::new()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn cluster_ip(svc: &mut Service) {
        if let Some(spec) = svc.spec.as_mut() {
            spec.type_ = Some("ClusterIP".to_string());
        }
    }

    #[test]
    fn test_class_annotation_opts_out() {
        let mut svc = lb_service();
        assert!(is_process_needed(&svc));
        svc.annotations_mut()
            .insert(annotations::SERVICE_CLASS.to_string(), "other".to_string());
        assert!(!is_process_needed(&svc));
        svc.annotations_mut()
            .insert(annotations::SERVICE_CLASS.to_string(), String::new());
        assert!(is_process_needed(&svc));
    }

    #[test]
    fn test_needs_load_balancer() {
        let mut svc = lb_service();
        assert!(needs_load_balancer(&svc));
        svc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!needs_load_balancer(&svc));

        let mut plain = lb_service();
        cluster_ip(&mut plain);
        assert!(!needs_load_balancer(&plain));
        assert!(!need_add(&plain));
        plain
            .labels_mut()
            .insert(annotations::SERVICE_HASH_LABEL.to_string(), "x".to_string());
        assert!(need_add(&plain));
    }

    #[test]
    fn test_service_change_ignores_label_and_status_updates() {
        let old = lb_service();
        let mut new = old.clone();
        new.labels_mut()
            .insert(annotations::SERVICE_HASH_LABEL.to_string(), "abc".to_string());
        new.metadata.resource_version = Some("42".to_string());
        assert_eq!(service_change(&old, &new), ServiceChange::Ignore);
    }

    #[test]
    fn test_service_change_detects_relevant_updates() {
        let old = lb_service();

        let mut annotated = old.clone();
        annotated
            .annotations_mut()
            .insert(annotations::LOAD_BALANCER_ID.to_string(), "lb-1".to_string());
        assert_eq!(service_change(&old, &annotated), ServiceChange::Sync);

        let mut deleting = old.clone();
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(service_change(&old, &deleting), ServiceChange::Sync);

        let mut retyped = old.clone();
        cluster_ip(&mut retyped);
        assert_eq!(
            service_change(&old, &retyped),
            ServiceChange::TypeChanged("LoadBalancer".to_string(), "ClusterIP".to_string())
        );
    }

    #[test]
    fn test_service_change_ignores_unmanaged_services() {
        let mut old = lb_service();
        cluster_ip(&mut old);
        let mut new = old.clone();
        new.annotations_mut()
            .insert("team".to_string(), "infra".to_string());
        assert_eq!(service_change(&old, &new), ServiceChange::Ignore);
    }

    fn ready_node(status: &str, heartbeat: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    message: Some(heartbeat.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_heartbeat_is_not_a_change() {
        assert!(!node_spec_changed(
            &ready_node("True", "beat 1"),
            &ready_node("True", "beat 2")
        ));
        assert!(node_spec_changed(
            &ready_node("True", "beat"),
            &ready_node("False", "beat")
        ));
        let mut labelled = ready_node("True", "beat");
        labelled
            .labels_mut()
            .insert("zone".to_string(), "a".to_string());
        assert!(node_spec_changed(&ready_node("True", "beat"), &labelled));
    }

    #[test]
    fn test_endpoints_changed_compares_subsets() {
        let ep = |ip: &str| Endpoints {
            metadata: ObjectMeta::default(),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: ip.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        };
        let mut touched = ep("10.0.0.1");
        touched.metadata.resource_version = Some("2".to_string());
        assert!(!endpoints_changed(&ep("10.0.0.1"), &touched));
        assert!(endpoints_changed(&ep("10.0.0.1"), &ep("10.0.0.2")));
    }

    #[test]
    fn test_status_equality_is_semantic() {
        let empty = LoadBalancerStatus { ingress: None };
        let empty_list = LoadBalancerStatus {
            ingress: Some(vec![]),
        };
        assert!(load_balancer_status_equal(&empty, &empty_list));

        let with_ip = LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some("1.2.3.4".to_string()),
                ..Default::default()
            }]),
        };
        assert!(!load_balancer_status_equal(&empty, &with_ip));
        assert!(load_balancer_status_equal(&with_ip, &with_ip.clone()));
    }

    #[test]
    fn test_hashes_track_relevant_content() {
        let svc = lb_service();
        let mut relabelled = svc.clone();
        relabelled
            .labels_mut()
            .insert("x".to_string(), "y".to_string());
        assert_eq!(service_hash(&svc).unwrap(), service_hash(&relabelled).unwrap());
        assert!(service_hash(&svc).unwrap().len() <= 63);

        let node = |name: &str| {
            Arc::new(Node {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
        };
        let a = ensure_fingerprint(&svc, &[node("n1"), node("n2")]).unwrap();
        let b = ensure_fingerprint(&svc, &[node("n2"), node("n1")]).unwrap();
        let c = ensure_fingerprint(&svc, &[node("n1")]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
