use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, LoadBalancerStatus, Node, Service, ServiceStatus};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};

use super::informer::{self, is_ready, EventHandler};
use super::{ClusterState, ServiceWriter, StatusWriteError};
use crate::annotations;
use crate::error::{Error, Result};

/// API-server backed cluster view over reflector stores
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    services: Store<Service>,
    nodes: Store<Node>,
    endpoints: Store<Endpoints>,
}

/// Write halves of the [`KubeCluster`] stores, consumed when the watches start
pub struct Informers {
    client: Client,
    services: Writer<Service>,
    nodes: Writer<Node>,
    endpoints: Writer<Endpoints>,
}

impl KubeCluster {
    pub fn new(client: Client) -> (Self, Informers) {
        let (services, service_writer) = reflector::store();
        let (nodes, node_writer) = reflector::store();
        let (endpoints, endpoint_writer) = reflector::store();
        let cluster = Self {
            client: client.clone(),
            services,
            nodes,
            endpoints,
        };
        let informers = Informers {
            client,
            services: service_writer,
            nodes: node_writer,
            endpoints: endpoint_writer,
        };
        (cluster, informers)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn services_api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl Informers {
    /// Spawn one watch per kind, all feeding `handler`
    pub fn start<H>(self, handler: Arc<H>) -> Vec<JoinHandle<()>>
    where
        H: EventHandler<Service> + EventHandler<Node> + EventHandler<Endpoints> + 'static,
    {
        let service_handler: Arc<dyn EventHandler<Service>> = handler.clone();
        let node_handler: Arc<dyn EventHandler<Node>> = handler.clone();
        let endpoint_handler: Arc<dyn EventHandler<Endpoints>> = handler;

        vec![
            tokio::spawn(informer::run(
                Api::<Service>::all(self.client.clone()),
                self.services,
                service_handler,
            )),
            tokio::spawn(informer::run(
                Api::<Node>::all(self.client.clone()),
                self.nodes,
                node_handler,
            )),
            tokio::spawn(informer::run(
                Api::<Endpoints>::all(self.client),
                self.endpoints,
                endpoint_handler,
            )),
        ]
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[async_trait]
impl ClusterState for KubeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>> {
        Ok(self.services.get(&ObjectRef::new(name).within(namespace)))
    }

    async fn nodes(&self) -> Result<Vec<Arc<Node>>> {
        Ok(self.nodes.state())
    }

    async fn fetch_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.services_api(namespace).get_opt(name).await?)
    }

    async fn wait_for_sync(&self) {
        let synced = futures::future::try_join3(
            self.services.wait_until_ready(),
            self.nodes.wait_until_ready(),
            self.endpoints.wait_until_ready(),
        )
        .await;
        if let Err(e) = synced {
            warn!("Informer stopped before its first listing: {}", e);
        }
    }

    fn is_synced(&self) -> bool {
        is_ready(&self.services) && is_ready(&self.nodes) && is_ready(&self.endpoints)
    }
}

#[async_trait]
impl ServiceWriter for KubeCluster {
    async fn update_load_balancer_status(
        &self,
        svc: &Service,
        status: &LoadBalancerStatus,
    ) -> std::result::Result<(), StatusWriteError> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        let api = self.services_api(&namespace);

        let mut latest = match api.get_opt(&name).await.map_err(Error::from)? {
            Some(latest) => latest,
            None => return Err(StatusWriteError::NotFound),
        };
        latest
            .status
            .get_or_insert_with(ServiceStatus::default)
            .load_balancer = Some(status.clone());

        let data = serde_json::to_vec(&latest).map_err(Error::from)?;
        match api.replace_status(&name, &PostParams::default(), data).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(StatusWriteError::NotFound),
            Err(e) if is_status(&e, 409) => Err(StatusWriteError::Conflict),
            Err(e) => Err(StatusWriteError::Failed(e.into())),
        }
    }

    async fn set_hash_label(&self, svc: &Service, hash: &str) -> Result<()> {
        let namespace = svc.namespace().unwrap_or_default();
        let patch = json!({
            "metadata": { "labels": { (annotations::SERVICE_HASH_LABEL): hash } }
        });
        self.services_api(&namespace)
            .patch(
                &svc.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(service = %svc.name_any(), "Stamped service hash {}", hash);
        Ok(())
    }

    async fn remove_hash_label(&self, svc: &Service) -> Result<()> {
        let namespace = svc.namespace().unwrap_or_default();
        let patch = json!({
            "metadata": { "labels": { (annotations::SERVICE_HASH_LABEL): null } }
        });
        match self
            .services_api(&namespace)
            .patch(
                &svc.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                warn!(service = %svc.name_any(), "Service gone before hash label removal");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
