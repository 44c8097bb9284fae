//! Retry timing
//!
//! [`RequeueBackoff`] turns repeated cloud throttling into a growing requeue
//! delay and relaxes it again only after a quiet period; nothing resets it on
//! success. [`retry`] is the bounded exponential helper that repeats an
//! operation while it keeps reporting [`Error::TryAgain`].

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::config::{BackoffConfig, RetryPolicy};
use crate::error::{Error, Result};

/// Per-worker throttling backoff
#[derive(Debug, Clone)]
pub struct RequeueBackoff {
    floor: Duration,
    factor: f64,
    ceiling: Duration,
    plateau: Duration,
    quiet_period: Duration,
    /// `None` while resting at the floor
    current: Option<Duration>,
    last_throttle: Option<Instant>,
}

pub type SharedBackoff = Arc<Mutex<RequeueBackoff>>;

impl RequeueBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            floor: Duration::from_secs(config.floor_secs),
            factor: config.factor,
            ceiling: Duration::from_secs(config.ceiling_secs),
            plateau: Duration::from_secs(config.plateau_secs),
            quiet_period: Duration::from_secs(config.quiet_period_secs),
            current: None,
            last_throttle: None,
        }
    }

    pub fn shared(config: &BackoffConfig) -> SharedBackoff {
        Arc::new(Mutex::new(Self::new(config)))
    }

    /// Delay for a key that was just throttled
    pub fn next(&mut self) -> Duration {
        self.next_at(Instant::now())
    }

    pub fn next_at(&mut self, now: Instant) -> Duration {
        self.last_throttle = Some(now);
        let next = match self.current {
            None => self.floor,
            Some(current) => {
                let grown = scale(current, self.factor);
                // sustained throttling: settle on the plateau instead of growing forever
                if grown > self.ceiling {
                    self.plateau
                } else {
                    grown
                }
            }
        };
        self.current = Some(next);
        next
    }

    /// Fall back to the floor when no throttling was seen for the quiet period.
    /// Returns true when the delay was reset.
    pub fn relax_at(&mut self, now: Instant) -> bool {
        match (self.current, self.last_throttle) {
            (Some(_), Some(last)) if now.saturating_duration_since(last) >= self.quiet_period => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    /// Delay the next throttled requeue would start from
    pub fn current(&self) -> Duration {
        self.current.unwrap_or(self.floor)
    }
}

/// Lock a shared backoff, recovering from poisoning
pub fn lock(backoff: &SharedBackoff) -> std::sync::MutexGuard<'_, RequeueBackoff> {
    backoff
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `delay * factor`, saturating on overflow and ignoring factors that would
/// shrink below zero or are not numbers
fn scale(delay: Duration, factor: f64) -> Duration {
    match Duration::try_from_secs_f64(delay.as_secs_f64() * factor) {
        Ok(scaled) => scaled,
        Err(_) if factor > 1.0 => Duration::MAX,
        Err(_) => delay,
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if !(jitter > 0.0) {
        return delay;
    }
    delay.saturating_add(scale(delay, rand::random::<f64>() * jitter))
}

/// Run `op` until it succeeds, fails with anything other than "try again",
/// or exhausts the policy's steps
pub async fn retry<F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = policy.initial();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_try_again() => {
                if attempt >= policy.steps {
                    warn!("Retry budget exhausted after {} attempts: {}", attempt, e);
                    return Err(Error::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                let wait = jittered(delay, policy.jitter);
                debug!("Retry with error: {}, next attempt in {:?}", e, wait);
                tokio::time::sleep(wait).await;
                delay = scale(delay, policy.factor);
            }
            Err(e) => {
                error!("Retry aborted, error is not retryable: {}", e);
                return Err(e);
            }
        }
    }
}
