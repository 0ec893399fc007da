//! Controller dispatch loop
//!
//! The dispatcher is the sole consumer of an entity type's queue. It turns
//! each [`QueueEntry`] into at most one controller or finalizer call and
//! schedules the follow-up requeue, one entry at a time.
//!
//! | Trigger              | Action                                           |
//! |----------------------|--------------------------------------------------|
//! | `Deleted`            | `controller.deleted`                             |
//! | `StatusModified`     | skipped                                          |
//! | `FinalizersModified` | finalizers if deleting, else skipped             |
//! | `Reconcile`          | finalizers if deleting, else attach + reconcile  |
//! | `Requeue`            | re-read, then as `Reconcile`; gone is dropped    |
//!
//! Failures are requeued after the reconcile backoff delay for the entity's
//! number of consecutive failures.
//!
//! A dispatcher bound to a leadership channel drops every entry that
//! surfaces while this replica is not the leader, so requeues armed before a
//! step-down never reach the controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use kubeops_common::{metrics, BackoffPolicy, Error, LeadershipState, OperatorSettings};

use crate::client::EntityClient;
use crate::controller::{has_finalizer, Action, EntityController, EntityFinalizer};
use crate::entity::{entity_ref, is_deleting, Entity};
use crate::queue::{EntityRequeue, QueueEntry, ReconcileTrigger};

/// Invokes the controller for queued entities
pub struct Dispatcher<K: Entity> {
    kind: String,
    client: Arc<dyn EntityClient<K>>,
    controller: Arc<dyn EntityController<K>>,
    finalizers: Vec<Arc<dyn EntityFinalizer<K>>>,
    requeue: EntityRequeue<K>,
    backoff: BackoffPolicy,
    failures: HashMap<ObjectRef<K>, u32>,
    leadership: Option<watch::Receiver<LeadershipState>>,
    auto_attach: bool,
    auto_detach: bool,
}

impl<K: Entity> Dispatcher<K> {
    /// Create a dispatcher requeueing through `requeue`
    pub fn new(
        client: Arc<dyn EntityClient<K>>,
        controller: Arc<dyn EntityController<K>>,
        finalizers: Vec<Arc<dyn EntityFinalizer<K>>>,
        requeue: EntityRequeue<K>,
        settings: &OperatorSettings,
    ) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            client,
            controller,
            finalizers,
            requeue,
            backoff: BackoffPolicy::new(&settings.reconcile_backoff),
            failures: HashMap::new(),
            leadership: None,
            auto_attach: settings.auto_attach_finalizers,
            auto_detach: settings.auto_detach_finalizers,
        }
    }

    /// Only dispatch while `leadership` reports this replica as leader
    pub fn with_leadership(mut self, leadership: watch::Receiver<LeadershipState>) -> Self {
        self.leadership = Some(leadership);
        self
    }

    fn leading(&self) -> bool {
        self.leadership
            .as_ref()
            .map_or(true, |leadership| leadership.borrow().is_leader())
    }

    /// Consecutive failures recorded for `entity`
    pub fn failures(&self, entity: &K) -> u32 {
        self.failures
            .get(&ObjectRef::from_obj(entity))
            .copied()
            .unwrap_or(0)
    }

    /// Process entries until the stream ends
    pub async fn run(mut self, mut entries: BoxStream<'static, QueueEntry<K>>) {
        info!(kind = %self.kind, finalizers = self.finalizers.len(), "Dispatcher started");
        while let Some(entry) = entries.next().await {
            self.dispatch(entry).await;
        }
        info!(kind = %self.kind, "Dispatcher stopped");
    }

    /// Handle one queue entry
    #[instrument(
        skip(self, entry),
        fields(
            kind = %self.kind,
            entity = %entity_ref(entry.entity.meta()),
            trigger = entry.trigger.as_str()
        )
    )]
    pub async fn dispatch(&mut self, entry: QueueEntry<K>) {
        let QueueEntry { entity, trigger } = entry;
        if !self.leading() {
            debug!("Not leader, dropping entry");
            self.failures.remove(&ObjectRef::from_obj(&entity));
            return;
        }

        let entity = match trigger {
            ReconcileTrigger::Requeue => match self.refresh(&entity).await {
                Ok(Some(latest)) => latest,
                Ok(None) => {
                    debug!("Entity no longer exists, dropping requeue");
                    self.failures.remove(&ObjectRef::from_obj(&entity));
                    return;
                }
                Err(e) => {
                    self.on_failure(entity, e);
                    return;
                }
            },
            _ => entity,
        };

        let started = Instant::now();
        let outcome = match trigger {
            ReconcileTrigger::StatusModified => {
                debug!("Status-only change, skipping");
                return;
            }
            ReconcileTrigger::FinalizersModified if !is_deleting(entity.meta()) => {
                debug!("Finalizer-only change on live entity, skipping");
                return;
            }
            ReconcileTrigger::Deleted => {
                let result = self.controller.deleted(&entity).await;
                metrics::record_reconcile(&self.kind, started.elapsed().as_secs_f64(), result.is_ok());
                self.failures.remove(&ObjectRef::from_obj(&entity));
                if let Err(e) = result {
                    error!(error = %e, "Deleted callback failed");
                }
                return;
            }
            ReconcileTrigger::FinalizersModified => self.finalize(&entity).await,
            ReconcileTrigger::Reconcile | ReconcileTrigger::Requeue => {
                if is_deleting(entity.meta()) {
                    self.finalize(&entity).await
                } else {
                    self.reconcile(entity.clone()).await
                }
            }
        };
        metrics::record_reconcile(&self.kind, started.elapsed().as_secs_f64(), outcome.is_ok());

        match outcome {
            Ok(action) => {
                self.failures.remove(&ObjectRef::from_obj(&entity));
                if let Some(delay) = action.requeue_after() {
                    debug!(delay_ms = delay.as_millis() as u64, "Requeue requested");
                    metrics::record_requeue(&self.kind, "requested");
                    self.requeue.requeue(entity, delay);
                }
            }
            Err(e) => self.on_failure(entity, e),
        }
    }

    async fn refresh(&self, entity: &K) -> Result<Option<K>, Error> {
        let meta = entity.meta();
        let Some(name) = meta.name.as_deref() else {
            warn!("Queued entity has no name");
            return Ok(None);
        };
        self.client.get(name, meta.namespace.as_deref()).await
    }

    async fn reconcile(&self, entity: K) -> Result<Action, Error> {
        let entity = self.attach_finalizers(entity).await?;
        self.controller.reconcile(&entity).await
    }

    async fn attach_finalizers(&self, entity: K) -> Result<K, Error> {
        if !self.auto_attach {
            return Ok(entity);
        }

        let missing: Vec<String> = self
            .finalizers
            .iter()
            .map(|f| f.identifier())
            .filter(|id| !has_finalizer(entity.meta(), id))
            .collect();
        if missing.is_empty() {
            return Ok(entity);
        }

        debug!(finalizers = ?missing, "Attaching finalizers");
        let mut updated = entity;
        updated
            .meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .extend(missing);
        self.client.update(&updated).await
    }

    async fn finalize(&self, entity: &K) -> Result<Action, Error> {
        let mut current = entity.clone();

        for finalizer in &self.finalizers {
            let id = finalizer.identifier();
            if !has_finalizer(current.meta(), &id) {
                continue;
            }

            finalizer
                .finalize(&current)
                .await
                .map_err(|e| Error::finalizer(&id, entity_ref(current.meta()), e.to_string()))?;
            info!(finalizer = %id, "Finalizer completed");

            if self.auto_detach {
                if let Some(list) = current.meta_mut().finalizers.as_mut() {
                    list.retain(|f| f != &id);
                }
                current = self.client.update(&current).await?;
            }
        }

        Ok(Action::await_change())
    }

    fn on_failure(&mut self, entity: K, e: Error) {
        let failures = self
            .failures
            .entry(ObjectRef::from_obj(&entity))
            .or_insert(0);
        *failures = failures.saturating_add(1);
        let delay: Duration = self.backoff.delay_for(*failures);

        error!(
            error = %e,
            failures = *failures,
            delay_ms = delay.as_millis() as u64,
            "Reconcile failed, requeueing"
        );
        metrics::record_requeue(&self.kind, "error");
        self.requeue.requeue(entity, delay);
    }
}
