//! Cluster object access
//!
//! The reconciliation engine reads Services and Nodes through [`ClusterState`]
//! and writes back through [`ServiceWriter`]. [`KubeCluster`] implements both
//! on top of watch-backed local stores; [`MemoryCluster`] is the in-process
//! stand-in used by tests.

pub mod informer;
mod kube_cluster;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use thiserror::Error;

use crate::error::{Error, Result};

pub use informer::{EventHandler, ResourceEvent};
pub use kube_cluster::{Informers, KubeCluster};
pub use memory::MemoryCluster;

/// Read side of the cluster as seen by the reconciler
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// Service from the local list cache; `None` when it is not there
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>>;

    /// Every known node
    async fn nodes(&self) -> Result<Vec<Arc<Node>>>;

    /// Service read straight from the API server
    async fn fetch_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Resolves once every watched kind finished its initial listing
    async fn wait_for_sync(&self);

    fn is_synced(&self) -> bool;
}

/// Outcome of a failed status write
#[derive(Error, Debug)]
pub enum StatusWriteError {
    #[error("service not found")]
    NotFound,

    #[error("service was modified concurrently")]
    Conflict,

    #[error(transparent)]
    Failed(#[from] Error),
}

/// Write side used by the reconciler
#[async_trait]
pub trait ServiceWriter: Send + Sync {
    /// Re-read the latest service and replace its status subresource
    async fn update_load_balancer_status(
        &self,
        svc: &Service,
        status: &LoadBalancerStatus,
    ) -> std::result::Result<(), StatusWriteError>;

    async fn set_hash_label(&self, svc: &Service, hash: &str) -> Result<()>;

    async fn remove_hash_label(&self, svc: &Service) -> Result<()>;
}
