//! Well-known annotation and label keys read or written by the controller

/// A non-empty value hands the service to a different load balancer controller.
pub const SERVICE_CLASS: &str = "service.beta.kubernetes.io/class";

/// When set to `"on"`, unschedulable nodes are dropped from the backend pool.
pub const REMOVE_UNSCHEDULED_BACKEND: &str =
    "service.beta.kubernetes.io/alibaba-cloud-loadbalancer-remove-unscheduled-backend";

/// Reuse an existing cloud load balancer instead of creating one.
pub const LOAD_BALANCER_ID: &str = "service.beta.kubernetes.io/alibaba-cloud-loadbalancer-id";

/// Extra `key=value` tags attached to a load balancer the controller creates.
pub const ADDITIONAL_RESOURCE_TAGS: &str =
    "service.beta.kubernetes.io/alibaba-cloud-loadbalancer-additional-resource-tags";

/// Content hash of the last service spec the controller converged.
///
/// Only used by this controller for change detection; never for scheduling.
pub const SERVICE_HASH_LABEL: &str = "service.beta.kubernetes.io/hash";

pub const LABEL_NODE_ROLE_MASTER: &str = "node-role.kubernetes.io/master";
pub const LABEL_NODE_ROLE_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";

/// Nodes carrying `type=virtual-kubelet` are elastic container nodes.
pub const LABEL_NODE_TYPE: &str = "type";
pub const VIRTUAL_NODE_TYPE: &str = "virtual-kubelet";

/// Nodes carrying either label are never managed as load balancer backends.
pub const LABEL_EXCLUDE_FROM_LB: &str = "node.kubernetes.io/exclude-from-external-load-balancers";
pub const LABEL_EXCLUDE_BALANCER_LEGACY: &str =
    "alpha.service-controller.kubernetes.io/exclude-balancer";
