//! Controller and finalizer seams
//!
//! Operators implement [`EntityController`] for each entity type they own and
//! optionally one [`EntityFinalizer`] per cleanup step that must run before
//! the API server may delete an entity.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

#[cfg(test)]
use mockall::automock;

use kubeops_common::Error;

use crate::entity::Entity;

/// What the dispatcher should do after a successful reconcile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the entity again after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Wait for the next watch event
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    /// Requested delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Business logic for one entity type
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntityController<K: Entity>: Send + Sync {
    /// Drive the cluster towards the entity's desired state
    async fn reconcile(&self, entity: &K) -> Result<Action, Error>;

    /// React to an entity that has been removed from the cluster
    async fn deleted(&self, entity: &K) -> Result<(), Error>;
}

/// A cleanup step that blocks deletion until it succeeds
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntityFinalizer<K: Entity>: Send + Sync {
    /// Identifier stored in `metadata.finalizers`, e.g. `example.com/cleanup`
    fn identifier(&self) -> String;

    /// Release whatever the entity owns outside the cluster object
    async fn finalize(&self, entity: &K) -> Result<(), Error>;
}

/// Whether `finalizer` is present on the entity
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|list| list.iter().any(|f| f == finalizer))
}
