//! Pull-reconcile-requeue loop
//!
//! Each worker owns one throttling backoff. Throttled failures are requeued
//! with the backoff's growing delay, every other failure with a fixed delay.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::backoff::{self, SharedBackoff};
use super::key::ServiceKey;
#[cfg(feature = "metrics")]
use super::metrics;
use super::queue::WorkQueue;
use super::reconciler::Reconciler;

pub struct Worker {
    id: usize,
    queue: WorkQueue<ServiceKey>,
    reconciler: Arc<Reconciler>,
    backoff: SharedBackoff,
    error_requeue: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: WorkQueue<ServiceKey>,
        reconciler: Arc<Reconciler>,
        backoff: SharedBackoff,
        error_requeue: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            reconciler,
            backoff,
            error_requeue,
        }
    }

    /// Process keys until the queue shuts down
    pub async fn run(self) {
        info!(worker = self.id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
            #[cfg(feature = "metrics")]
            metrics::set_workqueue_depth(self.queue.len());
        }
        info!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, key: &ServiceKey) {
        debug!(worker = self.id, key = %key, "Queued sync for service");

        let result = AssertUnwindSafe(self.reconciler.sync(key))
            .catch_unwind()
            .await;
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => {
                error!(worker = self.id, key = %key, "Sync panicked, requeueing");
                self.requeue(key, self.error_requeue, "panic");
                return;
            }
        };

        if err.is_throttled() {
            let next = backoff::lock(&self.backoff).next();
            warn!(key = %key, "Request was throttled, retry in {:?}", next);
            self.requeue(key, next, "throttled");
        } else {
            self.requeue(key, self.error_requeue, "error");
        }
        error!(key = %key, "Requeue: sync error for service: {}", err);
    }

    fn requeue(&self, key: &ServiceKey, delay: Duration, reason: &str) {
        #[cfg(feature = "metrics")]
        metrics::inc_requeue(reason);
        debug!(key = %key, reason, "Requeue in {:?}", delay);
        self.queue.add_after(key.clone(), delay);
    }
}
