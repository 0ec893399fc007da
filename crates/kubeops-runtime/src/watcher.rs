//! Long-lived, self-healing watch over one entity type
//!
//! The watch loop runs in a spawned task. Each connection resumes from the
//! last resource version it saw; a cleanly closed connection is reopened at
//! once, a failed one after waiting on the [`BackoffPolicy`]. Accepted
//! events are classified with the [`ResourceCache`] and handed to the
//! [`TimedEntityQueue`] with zero delay.
//!
//! # States
//!
//! `Stopped -> Starting -> Watching -> (Closed | Errored) -> Starting -> ... -> Stopped`
//!
//! The current state is published over a `watch` channel.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use kubeops_common::{metrics, BackoffPolicy, Error, OperatorSettings, WaitOutcome};

use crate::cache::ResourceCache;
use crate::client::{EntityClient, WatchEvent, WatchRequest, WatchStream};
use crate::entity::{entity_ref, Entity};
use crate::queue::{ReconcileTrigger, TimedEntityQueue};

/// Resource version that asks the server for a fresh list of ADDED events
pub const INITIAL_RESOURCE_VERSION: &str = "0";

/// Status code of an expired resource version
const GONE: u16 = 410;

/// Lifecycle of a [`ResourceWatcher`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WatcherState {
    /// No watch loop running
    #[default]
    Stopped,
    /// Opening a connection
    Starting,
    /// Connected and streaming events
    Watching,
    /// Connection ended cleanly, about to reconnect
    Closed,
    /// Connection failed, backing off before reconnecting
    Errored,
}

/// How one connection ended
enum WatchEnd {
    Cancelled,
    Closed,
    Gone,
    Failed(Error),
}

struct ActiveWatch {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Watch loop state shared with the spawned task
struct WatchLoop<K: Entity> {
    kind: String,
    client: Arc<dyn EntityClient<K>>,
    cache: Arc<ResourceCache<K>>,
    queue: Arc<TimedEntityQueue<K>>,
    backoff: BackoffPolicy,
    namespace: Option<String>,
    timeout_secs: u32,
    stability_window: Duration,
    state: watch::Sender<WatcherState>,
}

/// Resumable watch for entity type `K`
pub struct ResourceWatcher<K: Entity> {
    inner: Arc<WatchLoop<K>>,
    active: Mutex<Option<ActiveWatch>>,
}

impl<K: Entity> ResourceWatcher<K> {
    /// Create a stopped watcher
    pub fn new(
        client: Arc<dyn EntityClient<K>>,
        cache: Arc<ResourceCache<K>>,
        queue: Arc<TimedEntityQueue<K>>,
        settings: &OperatorSettings,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Stopped);
        Self {
            inner: Arc::new(WatchLoop {
                kind: K::kind(&()).to_string(),
                client,
                cache,
                queue,
                backoff: BackoffPolicy::new(&settings.watch_backoff),
                namespace: settings.namespace.clone(),
                timeout_secs: settings.watch_timeout_secs,
                stability_window: settings.watch_backoff.stability_window,
                state,
            }),
            active: Mutex::new(None),
        }
    }

    /// Start watching; a no-op while a watch loop is already running
    pub fn start(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|a| !a.handle.is_finished()) {
            debug!(kind = %self.inner.kind, "Watcher already running");
            return;
        }

        info!(kind = %self.inner.kind, namespace = ?self.inner.namespace, "Starting watcher");
        let token = CancellationToken::new();
        let watch_loop = Arc::clone(&self.inner);
        let handle = tokio::spawn(watch_loop.run(token.clone()));
        *active = Some(ActiveWatch { token, handle });
    }

    /// Stop the watch loop and wait for it to exit
    ///
    /// Idempotent. The watcher stays stopped until the next [`start`](Self::start).
    pub async fn stop(&self) {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(active) = active {
            active.token.cancel();
            if let Err(e) = active.handle.await {
                error!(kind = %self.inner.kind, error = %e, "Watch task failed");
            }
            info!(kind = %self.inner.kind, "Watcher stopped");
        }
        self.inner.publish(WatcherState::Stopped);
    }

    /// Current state
    pub fn state(&self) -> WatcherState {
        *self.inner.state.borrow()
    }

    /// Receiver for state transitions
    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.inner.state.subscribe()
    }

    /// Drop every entry waiting in the queue this watcher feeds
    pub fn discard_pending(&self) {
        self.inner.queue.clear();
    }

    /// Consecutive watch failures since the last stable connection
    pub fn retries(&self) -> u32 {
        self.inner.backoff.retries()
    }
}

impl<K: Entity> Drop for ResourceWatcher<K> {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active {
            active.token.cancel();
            active.handle.abort();
        }
    }
}

impl<K: Entity> WatchLoop<K> {
    fn publish(&self, state: WatcherState) {
        self.state.send_replace(state);
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        self.cache.clear();
        let mut resource_version = INITIAL_RESOURCE_VERSION.to_string();

        while !token.is_cancelled() {
            self.publish(WatcherState::Starting);
            let request = WatchRequest {
                namespace: self.namespace.clone(),
                resource_version: resource_version.clone(),
                timeout_secs: self.timeout_secs,
                label_selector: None,
            };
            debug!(kind = %self.kind, resource_version = %request.resource_version, "Opening watch");

            let opened = tokio::select! {
                _ = token.cancelled() => break,
                opened = self.client.watch(&request) => opened,
            };

            let end = match opened {
                Ok(stream) => {
                    self.publish(WatcherState::Watching);
                    self.consume(stream, &mut resource_version, &token).await
                }
                Err(e) => WatchEnd::Failed(e),
            };

            match end {
                WatchEnd::Cancelled => break,
                WatchEnd::Closed => {
                    debug!(kind = %self.kind, resource_version = %resource_version, "Watch closed, reconnecting");
                    metrics::record_watch_restart(&self.kind, "closed");
                    self.publish(WatcherState::Closed);
                }
                WatchEnd::Gone => {
                    warn!(kind = %self.kind, "Resource version expired, relisting");
                    metrics::record_watch_restart(&self.kind, "gone");
                    resource_version = INITIAL_RESOURCE_VERSION.to_string();
                    self.cache.clear();
                    self.publish(WatcherState::Closed);
                }
                WatchEnd::Failed(e) => {
                    error!(kind = %self.kind, error = %e, "Watch failed");
                    metrics::record_watch_restart(&self.kind, "error");
                    self.publish(WatcherState::Errored);
                    if self.backoff.wait_on_error(&e, &token).await == WaitOutcome::Cancelled {
                        break;
                    }
                }
            }
        }

        self.publish(WatcherState::Stopped);
    }

    async fn consume(
        &self,
        mut stream: WatchStream<K>,
        resource_version: &mut String,
        token: &CancellationToken,
    ) -> WatchEnd {
        let stability = tokio::time::sleep(self.stability_window);
        tokio::pin!(stability);
        let mut stable = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => return WatchEnd::Cancelled,

                _ = &mut stability, if !stable => {
                    stable = true;
                    if self.backoff.retries() > 0 {
                        debug!(kind = %self.kind, "Watch stable, clearing backoff");
                        self.backoff.clear();
                    }
                }

                item = stream.next() => match item {
                    None => return WatchEnd::Closed,
                    Some(Err(e)) => return WatchEnd::Failed(e),
                    Some(Ok(event)) => {
                        if let Some(end) = self.handle_event(event, resource_version) {
                            return end;
                        }
                    }
                },
            }
        }
    }

    fn handle_event(&self, event: WatchEvent<K>, resource_version: &mut String) -> Option<WatchEnd> {
        let event_type = event.event_type();
        metrics::record_watch_event(&self.kind, event_type.as_str());
        if let Some(rv) = event.resource_version() {
            *resource_version = rv.to_string();
        }

        match event {
            WatchEvent::Added(entity) | WatchEvent::Modified(entity) => {
                let result = self.cache.upsert(&entity);
                trace!(
                    kind = %self.kind,
                    entity = %entity_ref(entity.meta()),
                    event = event_type.as_str(),
                    result = ?result,
                    "Watch event"
                );
                self.queue.enqueue(entity, Duration::ZERO, result.into());
            }
            WatchEvent::Deleted(entity) => {
                trace!(kind = %self.kind, entity = %entity_ref(entity.meta()), "Watch event deleted");
                self.cache.remove(&entity);
                self.queue.enqueue(entity, Duration::ZERO, ReconcileTrigger::Deleted);
            }
            WatchEvent::Bookmark { .. } => {
                trace!(kind = %self.kind, resource_version = %resource_version, "Bookmark");
            }
            WatchEvent::Error { code, message } => {
                if code == GONE {
                    return Some(WatchEnd::Gone);
                }
                warn!(kind = %self.kind, code = code, message = %message, "Watch error event");
            }
        }
        None
    }
}
