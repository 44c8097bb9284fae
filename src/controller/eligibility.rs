//! Backend node selection
//!
//! Decides which cluster nodes may sit in a service's load balancer backend
//! pool. Nodes excluded from cloud management altogether are filtered out
//! before the per-service predicate runs.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use tracing::debug;

use crate::annotations;

const CONDITION_READY: &str = "Ready";
const CONDITION_TRUE: &str = "True";
const TRAFFIC_POLICY_CLUSTER: &str = "Cluster";

/// Nodes the operator excluded from external load balancing entirely
pub fn is_excluded_node(node: &Node) -> bool {
    let labels = node.labels();
    labels.contains_key(annotations::LABEL_EXCLUDE_FROM_LB)
        || labels.contains_key(annotations::LABEL_EXCLUDE_BALANCER_LEGACY)
}

fn is_master(node: &Node) -> bool {
    let labels = node.labels();
    labels.contains_key(annotations::LABEL_NODE_ROLE_MASTER)
        || labels.contains_key(annotations::LABEL_NODE_ROLE_CONTROL_PLANE)
}

fn is_virtual_node(node: &Node) -> bool {
    node.labels().get(annotations::LABEL_NODE_TYPE).map(String::as_str)
        == Some(annotations::VIRTUAL_NODE_TYPE)
}

fn removes_unschedulable(svc: &Service) -> bool {
    svc.annotations()
        .get(annotations::REMOVE_UNSCHEDULED_BACKEND)
        .map(String::as_str)
        == Some("on")
}

fn has_cluster_traffic_policy(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.external_traffic_policy.as_deref())
        == Some(TRAFFIC_POLICY_CLUSTER)
}

/// Whether `node` qualifies as a load balancer backend for `svc`
pub fn is_eligible(svc: &Service, node: &Node) -> bool {
    let node_name = node.name_any();

    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    if unschedulable && removes_unschedulable(svc) {
        debug!(node = %node_name, "Ignoring unschedulable node");
        return false;
    }

    // traffic entering a master is re-routed by kube-proxy only under the Cluster policy
    if is_master(node) && !has_cluster_traffic_policy(svc) {
        debug!(node = %node_name, "Ignoring master node");
        return false;
    }

    // virtual nodes report no standard conditions
    if is_virtual_node(node) {
        return true;
    }

    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    if conditions.is_empty() {
        return false;
    }

    for cond in conditions {
        if cond.type_ == CONDITION_READY && cond.status != CONDITION_TRUE {
            debug!(
                node = %node_name,
                "Ignoring node with {} condition status {}", cond.type_, cond.status
            );
            return false;
        }
    }
    true
}

/// Eligible backends for `svc`, in the order the nodes were listed
pub fn available_nodes(svc: &Service, nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
    nodes
        .iter()
        .filter(|n| !is_excluded_node(n))
        .filter(|n| is_eligible(svc, n))
        .cloned()
        .collect()
}
