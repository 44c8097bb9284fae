//! Service sync state machine
//!
//! Given a key, [`Reconciler::sync`] re-reads the service, drives the cloud
//! load balancer toward it and publishes the outcome in the service status.
//!
//! - Service gone from the local cache: delete the load balancer of the last
//!   known object, or do nothing when no object was ever seen.
//! - UID changed under the same key: delete for the new identity, then ensure.
//! - Service no longer wants a load balancer: delete it if it exists, drop
//!   the cache entry and the hash label, publish an empty status.
//! - Otherwise ensure the load balancer, skipping the cloud call when the
//!   service and its backend set are unchanged since the last success.
//!
//! The cache is written only after the whole update succeeded.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{LoadBalancerStatus, Service};
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::backoff::retry;
use super::cache::{CachedService, ServiceCache};
use super::eligibility::available_nodes;
use super::events::{
    EventRecorder, EventType, REASON_DELETED_LOAD_BALANCER, REASON_DELETE_LOAD_BALANCER_FAILED,
    REASON_ENSURED_LOAD_BALANCER, REASON_SYNC_LOAD_BALANCER_FAILED,
    REASON_UNAVAILABLE_LOAD_BALANCER,
};
use super::key::ServiceKey;
#[cfg(feature = "metrics")]
use super::metrics;
use super::predicates::{
    ensure_fingerprint, load_balancer_status_equal, needs_load_balancer, service_hash,
};
use crate::annotations;
use crate::cloud::LoadBalancerBackend;
use crate::cluster::{ClusterState, ServiceWriter, StatusWriteError};
use crate::config::{ControllerConfig, RetryPolicy};
use crate::error::{Error, Result};

/// Result of a successful ensure
struct Ensured {
    status: LoadBalancerStatus,
    fingerprint: String,
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterState>,
    writer: Arc<dyn ServiceWriter>,
    backend: Arc<dyn LoadBalancerBackend>,
    recorder: Arc<dyn EventRecorder>,
    cache: ServiceCache,
    delete_retry: RetryPolicy,
    status_retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterState>,
        writer: Arc<dyn ServiceWriter>,
        backend: Arc<dyn LoadBalancerBackend>,
        recorder: Arc<dyn EventRecorder>,
        cache: ServiceCache,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            writer,
            backend,
            recorder,
            cache,
            delete_retry: config.delete_retry.clone(),
            status_retry: config.status_retry.clone(),
        }
    }

    pub fn cache(&self) -> &ServiceCache {
        &self.cache
    }

    /// Converge the load balancer of one service
    #[instrument(skip_all, fields(key = %key))]
    pub async fn sync(&self, key: &ServiceKey) -> Result<()> {
        let start = Instant::now();
        let result = self.sync_service(key).await;

        #[cfg(feature = "metrics")]
        {
            metrics::observe_operation("reconcile", start.elapsed());
            if let Err(e) = &result {
                metrics::inc_reconcile_error(e.metric_label());
            }
        }
        info!("Finished syncing service ({:?})", start.elapsed());
        result
    }

    async fn sync_service(&self, key: &ServiceKey) -> Result<()> {
        // absent on first processing, which is expected
        let cached = self.cache.get(key);

        match self.cluster.get_service(&key.namespace, &key.name).await? {
            None => match cached {
                None => {
                    error!("Unexpected nil cached service for deletion, skipping");
                    Ok(())
                }
                Some(entry) => {
                    info!("Service has been deleted, cleaning up its load balancer");
                    self.delete_with_retry(&entry.service).await
                }
            },
            Some(svc) => self.update(key, cached, svc).await,
        }
    }

    async fn update(
        &self,
        key: &ServiceKey,
        cached: Option<CachedService>,
        svc: Arc<Service>,
    ) -> Result<()> {
        let Some(uid) = svc.metadata.uid.clone() else {
            error!("Service has no uid");
            return Err(Error::InvariantError(format!("service {} has no uid", key)));
        };

        // kept to avoid a status write when nothing changed
        let pre = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.clone())
            .unwrap_or_default();

        let mut cached = cached;
        if let Some(entry) = &cached {
            if entry.uid.as_deref() != Some(uid.as_str()) {
                warn!(
                    "UID changed {} -> {}, deleting load balancer before ensuring",
                    entry.uid.as_deref().unwrap_or("<none>"),
                    uid
                );
                self.delete_with_retry(&svc).await?;
                cached = None;
            }
        }

        if !needs_load_balancer(&svc) {
            if self.backend.exists(&svc).await?.is_some() {
                info!("Deleting load balancer which is no longer needed");
                self.delete_with_retry(&svc).await?;
            }
            self.cache.remove(key);
            if svc.labels().contains_key(annotations::SERVICE_HASH_LABEL) {
                self.writer.remove_hash_label(&svc).await?;
            }
            return self
                .update_status(key, &svc, &pre, &LoadBalancerStatus::default())
                .await;
        }

        let ensured = self.ensure(key, &svc, cached.as_ref()).await?;
        self.update_status(key, &svc, &pre, &ensured.status).await?;

        self.cache.set(
            key.clone(),
            CachedService {
                service: svc,
                uid: Some(uid),
                status: ensured.status,
                fingerprint: Some(ensured.fingerprint),
            },
        );
        Ok(())
    }

    async fn ensure(
        &self,
        key: &ServiceKey,
        svc: &Service,
        cached: Option<&CachedService>,
    ) -> Result<Ensured> {
        let nodes = available_nodes(svc, &self.cluster.nodes().await?);
        let fingerprint = ensure_fingerprint(svc, &nodes)?;

        if let Some(entry) = cached {
            if entry.fingerprint.as_deref() == Some(fingerprint.as_str()) {
                debug!("Load balancer is up to date, skipping ensure");
                return Ok(Ensured {
                    status: entry.status.clone(),
                    fingerprint,
                });
            }
        }

        if nodes.is_empty() {
            self.recorder.record(
                svc.object_ref(&()),
                EventType::Warning,
                REASON_UNAVAILABLE_LOAD_BALANCER,
                "There are no available nodes for LoadBalancer".to_string(),
            );
        }

        info!("Ensuring load balancer with {} backends", nodes.len());
        let start = Instant::now();
        let result = self.backend.ensure_load_balancer(svc, &nodes).await;
        #[cfg(feature = "metrics")]
        metrics::observe_operation("ensure", start.elapsed());
        debug!("Ensure took {:?}", start.elapsed());

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                self.recorder.record(
                    svc.object_ref(&()),
                    EventType::Warning,
                    REASON_SYNC_LOAD_BALANCER_FAILED,
                    format!("Error syncing load balancer: {}", e.event_message()),
                );
                return Err(Error::EnsureFailed {
                    key: key.to_string(),
                    source: e,
                });
            }
        };

        self.recorder.record(
            svc.object_ref(&()),
            EventType::Normal,
            REASON_ENSURED_LOAD_BALANCER,
            "Ensured load balancer".to_string(),
        );

        let hash = service_hash(svc)?;
        if svc.labels().get(annotations::SERVICE_HASH_LABEL) != Some(&hash) {
            self.writer.set_hash_label(svc, &hash).await?;
        }

        Ok(Ensured {
            status,
            fingerprint,
        })
    }

    /// Publish `status` unless it equals what the service already shows
    async fn update_status(
        &self,
        key: &ServiceKey,
        svc: &Service,
        pre: &LoadBalancerStatus,
        status: &LoadBalancerStatus,
    ) -> Result<()> {
        if load_balancer_status_equal(pre, status) {
            debug!("Not persisting unchanged LoadBalancerStatus");
            return Ok(());
        }

        debug!("Updating status {:?} -> {:?}", pre.ingress, status.ingress);
        let writer = &self.writer;
        retry(&self.status_retry, move || async move {
            match writer.update_load_balancer_status(svc, status).await {
                Ok(()) => Ok(()),
                // the delete event is on its way
                Err(StatusWriteError::NotFound) => {
                    info!("Not persisting update to service that no longer exists");
                    Ok(())
                }
                Err(StatusWriteError::Conflict) => Err(Error::StatusConflict(key.to_string())),
                Err(StatusWriteError::Failed(e)) => {
                    warn!("Failed to persist updated LoadBalancerStatus: {}", e);
                    Err(Error::TryAgain(format!("update status of {}: {}", key, e)))
                }
            }
        })
        .await
    }

    async fn delete_with_retry(&self, svc: &Service) -> Result<()> {
        retry(&self.delete_retry, move || async move { self.delete(svc).await }).await
    }

    /// Remove the load balancer unconditionally; the backend treats a missing one as success
    async fn delete(&self, svc: &Service) -> Result<()> {
        let key = ServiceKey::from_service(svc);
        info!("Deleting load balancer for service {}", key);

        let start = Instant::now();
        if let Err(e) = self.backend.ensure_load_balancer_deleted(svc).await {
            self.recorder.record(
                svc.object_ref(&()),
                EventType::Warning,
                REASON_DELETE_LOAD_BALANCER_FAILED,
                format!("Error deleting load balancer: {}", e.event_message()),
            );
            return Err(Error::TryAgain(format!(
                "delete load balancer of {}: {}",
                key, e
            )));
        }
        #[cfg(feature = "metrics")]
        metrics::observe_operation("delete", start.elapsed());
        debug!("Delete took {:?}", start.elapsed());

        self.recorder.record(
            svc.object_ref(&()),
            EventType::Normal,
            REASON_DELETED_LOAD_BALANCER,
            format!("LoadBalancer Deleted SUCCESS. {}", key),
        );
        self.cache.remove(&key);
        Ok(())
    }
}
