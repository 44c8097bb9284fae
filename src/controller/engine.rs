//! Top-level service controller lifecycle
//!
//! [`ServiceController`] wires the queue, cache, router, reconciler and workers
//! together and owns every periodic task: backoff decay and resync. Nothing
//! is started until [`ServiceController::run`] is called, and everything it
//! started is stopped before it returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::backoff::{self, RequeueBackoff, SharedBackoff};
use super::cache::ServiceCache;
use super::events::EventRecorder;
use super::key::ServiceKey;
#[cfg(feature = "metrics")]
use super::metrics;
use super::predicates::{is_process_needed, needs_load_balancer};
use super::queue::WorkQueue;
use super::reconciler::Reconciler;
use super::router::EventRouter;
use super::worker::Worker;
use crate::cloud::CloudProvider;
use crate::cluster::{ClusterState, ServiceWriter};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};

pub const QUEUE_NAME: &str = "service";

pub struct ServiceController {
    config: ControllerConfig,
    queue: WorkQueue<ServiceKey>,
    cache: ServiceCache,
    cluster: Arc<dyn ClusterState>,
    reconciler: Arc<Reconciler>,
    router: Arc<EventRouter>,
}

impl ServiceController {
    /// Build the controller, failing fast when the cloud provider offers no load balancers
    pub fn new(
        config: ControllerConfig,
        cloud: &dyn CloudProvider,
        cluster: Arc<dyn ClusterState>,
        writer: Arc<dyn ServiceWriter>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = cloud
            .load_balancer()
            .ok_or_else(|| Error::MissingCapability {
                provider: cloud.name().to_string(),
                capability: "load balancer".to_string(),
            })?;

        let queue = WorkQueue::new(QUEUE_NAME);
        let cache = ServiceCache::new();
        let reconciler = Arc::new(Reconciler::new(
            cluster.clone(),
            writer,
            backend,
            recorder.clone(),
            cache.clone(),
            &config,
        ));
        let router = Arc::new(EventRouter::new(
            queue.clone(),
            cache.clone(),
            cluster.clone(),
            recorder,
        ));

        Ok(Self {
            config,
            queue,
            cache,
            cluster,
            reconciler,
            router,
        })
    }

    /// Handler to feed with watch deltas
    pub fn router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    pub fn queue(&self) -> &WorkQueue<ServiceKey> {
        &self.queue
    }

    pub fn cache(&self) -> &ServiceCache {
        &self.cache
    }

    /// Wait for the cluster caches, run the workers and periodic tasks until
    /// `stop` turns true, then drain
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!("Waiting for caches to sync");
        tokio::select! {
            _ = self.cluster.wait_for_sync() => {}
            _ = stopped(&mut stop) => {
                info!("Stopped before caches synced");
                self.queue.shut_down();
                return Ok(());
            }
        }

        let workers = self.config.workers;
        info!("Starting {} service workers", workers);
        let backoffs: Vec<SharedBackoff> = (0..workers)
            .map(|_| RequeueBackoff::shared(&self.config.backoff))
            .collect();

        let mut tasks = JoinSet::new();
        for (id, backoff) in backoffs.iter().enumerate() {
            let worker = Worker::new(
                id,
                self.queue.clone(),
                self.reconciler.clone(),
                backoff.clone(),
                self.config.error_requeue(),
            );
            tasks.spawn(worker.run());
        }

        let mut decay = periodic(Duration::from_secs(self.config.backoff.decay_check_secs));
        let mut resync = self.config.resync_period().map(periodic);

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = decay.tick() => self.relax_backoffs(&backoffs),
                _ = tick(&mut resync) => self.resync(),
            }
        }

        info!("Shutting down service controller");
        self.queue.shut_down();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Service controller stopped");
        Ok(())
    }

    fn relax_backoffs(&self, backoffs: &[SharedBackoff]) {
        let now = std::time::Instant::now();
        for (id, shared) in backoffs.iter().enumerate() {
            if backoff::lock(shared).relax_at(now) {
                debug!(worker = id, "Throttling ended, requeue delay back to floor");
            }
        }
        #[cfg(feature = "metrics")]
        metrics::set_workqueue_depth(self.queue.len());
    }

    /// Re-ensure every tracked service that still needs a load balancer
    pub fn resync(&self) {
        self.cache.mark_all_stale();
        let mut queued = 0;
        for (key, svc) in self.cache.services() {
            if needs_load_balancer(&svc) && is_process_needed(&svc) {
                self.queue.add(key);
                queued += 1;
            }
        }
        info!("Periodic resync enqueued {} services", queued);
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves once the stop flag is raised or its sender is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
