//! Leader election using Kubernetes Leases
//!
//! Provides the lock half of leader election for HA operator deployments
//! using the coordination.k8s.io/v1 Lease API. The timing loop that drives
//! it lives in the runtime's election service; this module only knows how
//! to acquire, renew and release one lease.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we report
//! "not acquired". Two replicas can never both believe they hold the lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::settings::OperatorSettings;
use crate::Error;

/// Leadership as seen by one replica
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LeadershipState {
    /// Not participating (election disabled or stopped)
    #[default]
    None,
    /// Competing for the lease
    Candidate,
    /// Holding the lease
    Leader,
}

impl LeadershipState {
    /// Whether this replica currently holds the lease
    pub fn is_leader(self) -> bool {
        self == Self::Leader
    }
}

/// A lease that can be acquired, renewed and released
///
/// This trait allows mocking the Lease API in tests while using the real
/// client in production.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquire the lease, or renew it if already held
    ///
    /// Returns `Ok(false)` when another holder owns an unexpired lease or a
    /// concurrent writer won the compare-and-swap.
    async fn try_acquire_or_renew(&self) -> Result<bool, Error>;

    /// Give up the lease so a standby can take over without waiting for expiry
    async fn release(&self) -> Result<(), Error>;
}

/// Lease-backed lock
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    field_manager: String,
    lease_duration: Duration,
}

impl LeaderElector {
    /// Create a new elector for the given lease
    pub fn new(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        lease_duration: Duration,
    ) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            field_manager: identity.to_string(),
            lease_duration,
        }
    }

    /// Create an elector from operator settings
    pub fn from_settings(client: Client, settings: &OperatorSettings) -> Self {
        let mut elector = Self::new(
            client,
            &settings.lease_name,
            &settings.lease_namespace,
            &settings.identity,
            settings.lease_duration,
        );
        elector.field_manager = settings.name.clone();
        elector
    }

    /// Identity written into the lease
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Spec naming this replica as holder, renewed at `now`
    fn claim(&self, now: DateTime<Utc>, acquired: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(acquired)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// Write `lease`, treating a lost compare-and-swap as "not held"
    async fn write(&self, api: &Api<Lease>, lease: &Lease, fresh: bool) -> Result<bool, Error> {
        let params = PostParams::default();
        let written = if fresh {
            api.create(&params, lease).await
        } else {
            api.replace(&self.lease_name, &params, lease).await
        };
        match written {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// What one acquisition attempt does with the lease it read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    /// No lease object yet
    Create,
    /// We already hold it
    Renew,
    /// Unheld or expired; claim it with the given transition count
    TakeOver { transitions: i32 },
    /// Someone else holds a live lease
    Wait,
}

fn next_step(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> Step {
    let Some(lease) = lease else {
        return Step::Create;
    };
    let spec = lease.spec.as_ref();
    match spec.and_then(|s| s.holder_identity.as_deref()) {
        Some(holder) if holder == identity => Step::Renew,
        Some(_) if !lease_expired(spec, now) => Step::Wait,
        _ => Step::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
        },
    }
}

#[async_trait]
impl LeaseLock for LeaderElector {
    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api = self.api();
        let now = Utc::now();
        let current = api.get_opt(&self.lease_name).await?;

        let step = next_step(current.as_ref(), &self.identity, now);
        let (lease, fresh) = match (step, current) {
            (Step::Wait, _) => return Ok(false),
            (Step::Create, _) => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.claim(now, now, 0)),
                };
                (lease, true)
            }
            (Step::Renew, Some(mut lease)) => {
                if lease.metadata.resource_version.is_none() {
                    return Err(Error::leader_election(&self.lease_name, "lease missing resourceVersion"));
                }
                let held = lease.spec.take().unwrap_or_default();
                let acquired = held.acquire_time.map(|t| t.0).unwrap_or(now);
                lease.spec = Some(self.claim(now, acquired, held.lease_transitions.unwrap_or(0)));
                (lease, false)
            }
            (Step::TakeOver { transitions }, Some(mut lease)) => {
                if lease.metadata.resource_version.is_none() {
                    return Err(Error::leader_election(&self.lease_name, "lease missing resourceVersion"));
                }
                lease.spec = Some(self.claim(now, now, transitions));
                (lease, false)
            }
            (_, None) => return Ok(false),
        };

        let held = self.write(&api, &lease, fresh).await?;
        match (held, step) {
            (true, Step::Create) => info!(identity = %self.identity, lease = %self.lease_name, "lease created, now holding"),
            (true, Step::TakeOver { transitions }) => {
                info!(identity = %self.identity, lease = %self.lease_name, transitions, "claimed unheld lease")
            }
            (true, _) => debug!(identity = %self.identity, "lease renewed"),
            (false, Step::Renew) => warn!(identity = %self.identity, "lease changed under us, leadership lost"),
            (false, _) => debug!(identity = %self.identity, "another replica won the lease write"),
        }
        Ok(held)
    }

    async fn release(&self) -> Result<(), Error> {
        let api = self.api();
        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, holder = ?holder, "lease held elsewhere, skipping release");
            return Ok(());
        }

        // An empty holder with a stale renewTime is claimable on the next attempt
        let stale = Utc::now() - chrono::Duration::seconds(self.lease_duration.as_secs() as i64 + 1);
        let patch = json!({ "spec": { "holderIdentity": null, "renewTime": MicroTime(stale) } });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        api.patch(&self.lease_name, &params, &Patch::Merge(&patch)).await?;

        info!(identity = %self.identity, lease = %self.lease_name, "lease released");
        Ok(())
    }
}

/// Whether a lease has passed `renewTime + leaseDurationSeconds`
///
/// A lease without renew time or duration counts as expired.
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}
