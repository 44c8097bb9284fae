//! Lease based leader election
//!
//! Only the holder of the `coordination.k8s.io/v1` Lease runs the controller.
//! Leadership is published on a watch channel; a replica that loses the
//! lease must stop reconciling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "service-lb-controller-leader";
pub const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What to do with the lease as currently observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    /// We hold it
    Renew,
    /// The holder let it expire
    TakeOver,
    /// Someone else holds a live lease
    Wait,
}

pub fn lease_action(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseAction::Renew;
    }

    let expired = spec
        .and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true);

    if expired {
        LeaseAction::TakeOver
    } else {
        LeaseAction::Wait
    }
}

/// Merge patch for `action`, guarded by the observed `resourceVersion`
pub fn lease_patch(
    action: LeaseAction,
    identity: &str,
    resource_version: Option<&str>,
    now: DateTime<Utc>,
) -> Option<serde_json::Value> {
    let spec = match action {
        LeaseAction::Wait => return None,
        LeaseAction::Renew => serde_json::json!({
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }),
        LeaseAction::TakeOver => serde_json::json!({
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }),
    };
    Some(serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "spec": spec,
    }))
}

/// A 409 on a lease write means another replica got there first
fn contested<T>(result: Result<T, kube::Error>) -> Result<bool, kube::Error> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(resp)) if resp.code == 409 => {
            debug!("Lost lease race: {}", resp.message);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Identity of this replica, from `HOSTNAME` or the system hostname
pub fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "service-lb-controller".to_string())
}

pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: kube::Client, namespace: &str, identity: impl Into<String>) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            identity: identity.into(),
        }
    }

    /// Campaign forever, publishing whether this replica currently leads
    pub async fn run(self, leading: watch::Sender<bool>) {
        info!(
            "Starting leader election for lease {}/{} as {}",
            self.namespace, LEASE_NAME, self.identity
        );
        loop {
            let was_leader = *leading.borrow();
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    if !was_leader {
                        info!("Acquired leadership for lease {}", LEASE_NAME);
                    }
                    leading.send_replace(true);
                    tokio::time::sleep(RENEW_INTERVAL).await;
                }
                Ok(false) => {
                    if was_leader {
                        warn!("Lost leadership for lease {}", LEASE_NAME);
                    }
                    leading.send_replace(false);
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    warn!("Leader election error: {:?}", e);
                    leading.send_replace(false);
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();

        let existing = match self.leases.get_opt(LEASE_NAME).await? {
            Some(lease) => lease,
            None => return contested(self.create(now).await),
        };

        let spec = existing.spec.as_ref();
        let action = lease_action(spec, &self.identity, now);
        match action {
            LeaseAction::Wait => debug!(
                "Lease held by {:?}",
                spec.and_then(|s| s.holder_identity.as_deref())
            ),
            LeaseAction::TakeOver => info!(
                "Lease held by {:?} has expired, taking over",
                spec.and_then(|s| s.holder_identity.as_deref())
            ),
            LeaseAction::Renew => {}
        }
        let patch = match lease_patch(
            action,
            &self.identity,
            existing.metadata.resource_version.as_deref(),
            now,
        ) {
            Some(patch) => patch,
            None => return Ok(false),
        };

        contested(
            self.leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                .await,
        )
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<(), kube::Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        self.leases.create(&PostParams::default(), &lease).await?;
        info!("Created lease {} with holder {}", LEASE_NAME, self.identity);
        Ok(())
    }
}

/// Resolves once leadership, after having been held, is lost
pub async fn lost(mut leading: watch::Receiver<bool>) {
    let mut held = false;
    loop {
        let now = *leading.borrow_and_update();
        if held && !now {
            return;
        }
        held |= now;
        if leading.changed().await.is_err() {
            return;
        }
    }
}
