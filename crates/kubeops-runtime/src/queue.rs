//! Delay-aware, deduplicating entity queue
//!
//! Producers (the watcher, requeue handles, the dispatcher itself) push
//! schedule requests through an unbounded channel, so enqueueing never
//! blocks and never runs the consumer inline. The single consumer owns a
//! `DelayQueue` plus an index from entity identity to its pending timer.
//!
//! # Coalescing
//!
//! At most one entry per identity (`ObjectRef`: kind + namespace + name) is
//! pending. A new schedule for a pending identity always carries the newer
//! entity. Whether it also replaces the trigger and the deadline depends on
//! trigger weight:
//!
//! `Deleted` > `Reconcile` = `Requeue` > `FinalizersModified` > `StatusModified`
//!
//! An equal or heavier trigger replaces both (last write wins, whether the
//! new delay is shorter or longer). A lighter one keeps the pending trigger
//! and deadline, so a status echo never cancels a pending reconcile. A
//! `Reconcile` also replaces a pending `Deleted`: the watcher only emits it
//! for an entity that exists again.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace};

use kubeops_common::Error;

use crate::cache::CacheComparisonResult;
use crate::entity::Entity;

/// Why an entity was queued
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReconcileTrigger {
    /// New entity or a change outside status/finalizers
    Reconcile,
    /// Only the status subtree changed
    StatusModified,
    /// Only the finalizer list changed
    FinalizersModified,
    /// The entity was deleted from the cluster
    Deleted,
    /// Delayed re-entry requested by a controller or by the error policy
    Requeue,
}

impl ReconcileTrigger {
    /// Label for logs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reconcile => "reconcile",
            Self::StatusModified => "status_modified",
            Self::FinalizersModified => "finalizers_modified",
            Self::Deleted => "deleted",
            Self::Requeue => "requeue",
        }
    }
}

impl ReconcileTrigger {
    fn weight(self) -> u8 {
        match self {
            Self::StatusModified => 0,
            Self::FinalizersModified => 1,
            Self::Reconcile | Self::Requeue => 2,
            Self::Deleted => 3,
        }
    }

    /// Whether a new schedule with this trigger replaces one pending with `pending`
    pub fn supersedes(self, pending: ReconcileTrigger) -> bool {
        match (self, pending) {
            (Self::Reconcile, Self::Deleted) => true,
            _ => self.weight() >= pending.weight(),
        }
    }
}

impl From<CacheComparisonResult> for ReconcileTrigger {
    fn from(result: CacheComparisonResult) -> Self {
        match result {
            CacheComparisonResult::Other => Self::Reconcile,
            CacheComparisonResult::StatusModified => Self::StatusModified,
            CacheComparisonResult::FinalizersModified => Self::FinalizersModified,
        }
    }
}

/// An entity delivered by the queue
#[derive(Clone, Debug)]
pub struct QueueEntry<K> {
    /// Latest enqueued version of the entity
    pub entity: K,
    /// Latest enqueued trigger
    pub trigger: ReconcileTrigger,
}

enum Command<K: Entity> {
    Schedule {
        key: ObjectRef<K>,
        entry: QueueEntry<K>,
        delay: Duration,
    },
    Clear,
}

/// Producer side shared by the queue and its requeue handles
struct Scheduler<K: Entity> {
    tx: mpsc::UnboundedSender<Command<K>>,
}

impl<K: Entity> Scheduler<K> {
    fn schedule(&self, entity: K, delay: Duration, trigger: ReconcileTrigger) {
        let key = ObjectRef::from_obj(&entity);
        trace!(entity = %key, delay_ms = delay.as_millis() as u64, trigger = trigger.as_str(), "Scheduling entity");
        let command = Command::Schedule {
            key,
            entry: QueueEntry { entity, trigger },
            delay,
        };
        if self.tx.send(command).is_err() {
            debug!("Queue consumer gone, dropping schedule request");
        }
    }
}

impl<K: Entity> Clone for Scheduler<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Timed, deduplicating queue for one entity type
pub struct TimedEntityQueue<K: Entity> {
    scheduler: Scheduler<K>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command<K>>>>,
}

impl<K: Entity> Default for TimedEntityQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Entity> TimedEntityQueue<K> {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            scheduler: Scheduler { tx },
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Deliver `entity` no earlier than `now + delay`, merging with any pending entry
    pub fn enqueue(&self, entity: K, delay: Duration, trigger: ReconcileTrigger) {
        self.scheduler.schedule(entity, delay, trigger);
    }

    /// Drop every pending entry
    pub fn clear(&self) {
        let _ = self.scheduler.tx.send(Command::Clear);
    }

    /// Handle controllers use to put an entity back with a delay
    pub fn requeue_handle(&self) -> EntityRequeue<K> {
        EntityRequeue {
            scheduler: self.scheduler.clone(),
        }
    }

    /// Take the consumer side of the queue
    ///
    /// The stream yields entries as their delays expire and ends when `token`
    /// is cancelled; pending timers are dropped with it. Only one consumer
    /// may exist per queue.
    pub fn consume(&self, token: CancellationToken) -> Result<BoxStream<'static, QueueEntry<K>>, Error> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::internal_with_context("queue already has a consumer", "queue"))?;

        let consumer = Consumer {
            rx,
            closed: false,
            delays: DelayQueue::new(),
            pending: HashMap::new(),
            token,
        };

        Ok(futures::stream::unfold(consumer, |mut consumer| async move {
            consumer.next_entry().await.map(|entry| (entry, consumer))
        })
        .boxed())
    }
}

struct Consumer<K: Entity> {
    rx: mpsc::UnboundedReceiver<Command<K>>,
    closed: bool,
    delays: DelayQueue<(ObjectRef<K>, QueueEntry<K>)>,
    pending: HashMap<ObjectRef<K>, delay_queue::Key>,
    token: CancellationToken,
}

impl<K: Entity> Consumer<K> {
    async fn next_entry(&mut self) -> Option<QueueEntry<K>> {
        loop {
            if self.closed && self.delays.is_empty() {
                return None;
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled() => return None,

                command = self.rx.recv(), if !self.closed => match command {
                    Some(command) => self.apply(command),
                    None => self.closed = true,
                },

                Some(expired) = self.delays.next(), if !self.delays.is_empty() => {
                    let (key, entry) = expired.into_inner();
                    self.pending.remove(&key);
                    return Some(entry);
                }
            }
        }
    }

    fn apply(&mut self, command: Command<K>) {
        match command {
            Command::Schedule { key, mut entry, delay } => {
                let timer = match self.pending.remove(&key) {
                    Some(previous) => {
                        let previous = self.delays.remove(&previous);
                        let deadline = previous.deadline();
                        let (_, pending) = previous.into_inner();
                        if entry.trigger.supersedes(pending.trigger) {
                            trace!(entity = %key, trigger = entry.trigger.as_str(), "Replacing pending entry");
                            self.delays.insert((key.clone(), entry), delay)
                        } else {
                            trace!(entity = %key, kept = pending.trigger.as_str(), "Refreshing pending entry");
                            if pending.trigger == ReconcileTrigger::Deleted {
                                entry.entity = pending.entity;
                            }
                            entry.trigger = pending.trigger;
                            self.delays.insert_at((key.clone(), entry), deadline)
                        }
                    }
                    None => self.delays.insert((key.clone(), entry), delay),
                };
                self.pending.insert(key, timer);
            }
            Command::Clear => {
                self.delays.clear();
                self.pending.clear();
            }
        }
    }
}

/// Cloneable `(entity, delay)` handle into a [`TimedEntityQueue`]
pub struct EntityRequeue<K: Entity> {
    scheduler: Scheduler<K>,
}

impl<K: Entity> Clone for EntityRequeue<K> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<K: Entity> EntityRequeue<K> {
    /// Reconcile `entity` again after `delay`
    pub fn requeue(&self, entity: K, delay: Duration) {
        self.scheduler.schedule(entity, delay, ReconcileTrigger::Requeue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{widget, Widget, WidgetStatus};
    use rstest::rstest;
    use tokio::time::{timeout, Instant};

    fn consume(queue: &TimedEntityQueue<Widget>) -> BoxStream<'static, QueueEntry<Widget>> {
        queue.consume(CancellationToken::new()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_identity_is_delivered_once() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        queue.enqueue(widget("ns", "a"), Duration::from_secs(1), ReconcileTrigger::Reconcile);
        queue.enqueue(widget("ns", "a"), Duration::from_secs(1), ReconcileTrigger::Reconcile);

        assert!(stream.next().await.is_some());
        assert!(timeout(Duration::from_secs(10), stream.next()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_honored() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        let started = Instant::now();
        queue.enqueue(widget("ns", "a"), Duration::from_secs(3), ReconcileTrigger::Reconcile);

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.entity.metadata.name.as_deref(), Some("a"));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_identities_both_surface() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        queue.enqueue(widget("app-ns1", "secret-name"), Duration::from_secs(1), ReconcileTrigger::Reconcile);
        queue.enqueue(widget("app-ns2", "secret-name"), Duration::from_secs(1), ReconcileTrigger::Reconcile);

        let mut namespaces = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while let Ok(Some(entry)) = tokio::time::timeout_at(deadline, stream.next()).await {
            namespaces.push(entry.entity.metadata.namespace.unwrap());
        }
        namespaces.sort();

        assert_eq!(namespaces, vec!["app-ns1", "app-ns2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins_with_shorter_delay() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        let started = Instant::now();
        queue.enqueue(widget("ns", "a"), Duration::from_secs(10), ReconcileTrigger::Requeue);
        let mut newer = widget("ns", "a");
        newer.spec.replicas = 5;
        queue.enqueue(newer, Duration::from_secs(1), ReconcileTrigger::Reconcile);

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.entity.spec.replicas, 5);
        assert_eq!(entry.trigger, ReconcileTrigger::Reconcile);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(timeout(Duration::from_secs(30), stream.next()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins_with_longer_delay() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        let started = Instant::now();
        queue.enqueue(widget("ns", "a"), Duration::from_secs(1), ReconcileTrigger::Reconcile);
        queue.enqueue(widget("ns", "a"), Duration::from_secs(5), ReconcileTrigger::Requeue);

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.trigger, ReconcileTrigger::Requeue);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_echo_keeps_pending_reconcile() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        let mut edited = widget("ns", "a");
        edited.spec.replicas = 9;
        queue.enqueue(edited, Duration::ZERO, ReconcileTrigger::Reconcile);
        let mut echoed = widget("ns", "a");
        echoed.spec.replicas = 9;
        echoed.status = Some(WidgetStatus { ready: true });
        queue.enqueue(echoed, Duration::ZERO, ReconcileTrigger::StatusModified);

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.trigger, ReconcileTrigger::Reconcile);
        assert_eq!(entry.entity.spec.replicas, 9);
        assert_eq!(entry.entity.status, Some(WidgetStatus { ready: true }));
        assert!(timeout(Duration::from_secs(60), stream.next()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_echo_keeps_requeue_deadline() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        let started = Instant::now();
        queue.requeue_handle().requeue(widget("ns", "a"), Duration::from_secs(5));
        queue.enqueue(widget("ns", "a"), Duration::ZERO, ReconcileTrigger::StatusModified);
        queue.enqueue(widget("ns", "a"), Duration::ZERO, ReconcileTrigger::FinalizersModified);

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.trigger, ReconcileTrigger::Requeue);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(timeout(Duration::from_secs(120), stream.next()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_does_not_mask_deletion() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        let mut gone = widget("ns", "a");
        gone.spec.replicas = 7;
        queue.enqueue(gone, Duration::ZERO, ReconcileTrigger::Deleted);
        queue.requeue_handle().requeue(widget("ns", "a"), Duration::ZERO);

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.trigger, ReconcileTrigger::Deleted);
        assert_eq!(entry.entity.spec.replicas, 7);
    }

    #[rstest]
    #[case(ReconcileTrigger::StatusModified, ReconcileTrigger::StatusModified, true)]
    #[case(ReconcileTrigger::StatusModified, ReconcileTrigger::FinalizersModified, false)]
    #[case(ReconcileTrigger::FinalizersModified, ReconcileTrigger::StatusModified, true)]
    #[case(ReconcileTrigger::StatusModified, ReconcileTrigger::Requeue, false)]
    #[case(ReconcileTrigger::FinalizersModified, ReconcileTrigger::Reconcile, false)]
    #[case(ReconcileTrigger::Requeue, ReconcileTrigger::Reconcile, true)]
    #[case(ReconcileTrigger::Reconcile, ReconcileTrigger::Requeue, true)]
    #[case(ReconcileTrigger::Requeue, ReconcileTrigger::Deleted, false)]
    #[case(ReconcileTrigger::Reconcile, ReconcileTrigger::Deleted, true)]
    #[case(ReconcileTrigger::Deleted, ReconcileTrigger::Requeue, true)]
    fn test_trigger_precedence(
        #[case] incoming: ReconcileTrigger,
        #[case] pending: ReconcileTrigger,
        #[case] replaces: bool,
    ) {
        assert_eq!(incoming.supersedes(pending), replaces);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_goes_through_consumer() {
        let queue = TimedEntityQueue::new();
        queue.enqueue(widget("ns", "a"), Duration::ZERO, ReconcileTrigger::Deleted);

        let mut stream = consume(&queue);
        let entry = stream.next().await.unwrap();
        assert_eq!(entry.trigger, ReconcileTrigger::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_stream_with_pending_entries() {
        let queue = TimedEntityQueue::new();
        let token = CancellationToken::new();
        let mut stream = queue.consume(token.clone()).unwrap();

        queue.enqueue(widget("ns", "a"), Duration::from_secs(60), ReconcileTrigger::Reconcile);
        token.cancel();

        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_pending_entries() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);

        queue.enqueue(widget("ns", "a"), Duration::from_secs(1), ReconcileTrigger::Reconcile);
        queue.clear();
        queue.enqueue(widget("ns", "b"), Duration::from_secs(2), ReconcileTrigger::Reconcile);

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.entity.metadata.name.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_handle_schedules_requeue_trigger() {
        let queue = TimedEntityQueue::new();
        let mut stream = consume(&queue);
        let requeue = queue.requeue_handle();

        requeue.clone().requeue(widget("ns", "a"), Duration::from_secs(2));

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.trigger, ReconcileTrigger::Requeue);
    }

    #[test]
    fn test_single_consumer() {
        let queue = TimedEntityQueue::<Widget>::new();
        assert!(queue.consume(CancellationToken::new()).is_ok());
        assert!(queue.consume(CancellationToken::new()).is_err());
    }
}
