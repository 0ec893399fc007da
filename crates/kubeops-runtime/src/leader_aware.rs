//! Leadership-gated watcher
//!
//! Only the replica holding the lease may watch and reconcile. A follower
//! task tracks the leadership channel and starts the inner watcher on
//! `Leader`. As soon as the state becomes anything else it stops the watcher
//! and discards the queued work, including pending requeues.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use kubeops_common::LeadershipState;

use crate::entity::Entity;
use crate::watcher::ResourceWatcher;

struct Follower {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// [`ResourceWatcher`] that runs only while this replica leads
pub struct LeaderAwareResourceWatcher<K: Entity> {
    watcher: Arc<ResourceWatcher<K>>,
    leadership: watch::Receiver<LeadershipState>,
    follower: Mutex<Option<Follower>>,
}

impl<K: Entity> LeaderAwareResourceWatcher<K> {
    /// Gate `watcher` on `leadership`
    pub fn new(watcher: ResourceWatcher<K>, leadership: watch::Receiver<LeadershipState>) -> Self {
        Self {
            watcher: Arc::new(watcher),
            leadership,
            follower: Mutex::new(None),
        }
    }

    /// The gated watcher
    pub fn watcher(&self) -> &ResourceWatcher<K> {
        &self.watcher
    }

    /// Begin following leadership changes; a no-op if already following
    pub fn start(&self) {
        let mut follower = self.follower.lock().unwrap_or_else(PoisonError::into_inner);
        if follower.as_ref().is_some_and(|f| !f.handle.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(follow(
            Arc::clone(&self.watcher),
            self.leadership.clone(),
            token.clone(),
        ));
        *follower = Some(Follower { token, handle });
    }

    /// Stop following and stop the inner watcher
    pub async fn stop(&self) {
        let follower = self
            .follower
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(follower) = follower {
            follower.token.cancel();
            if let Err(e) = follower.handle.await {
                error!(error = %e, "Leadership follower failed");
            }
        }
        self.watcher.stop().await;
    }
}

impl<K: Entity> Drop for LeaderAwareResourceWatcher<K> {
    fn drop(&mut self) {
        let follower = self
            .follower
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(follower) = follower {
            follower.token.cancel();
            follower.handle.abort();
        }
    }
}

async fn follow<K: Entity>(
    watcher: Arc<ResourceWatcher<K>>,
    mut leadership: watch::Receiver<LeadershipState>,
    token: CancellationToken,
) {
    loop {
        let state = *leadership.borrow_and_update();
        if state.is_leader() {
            info!(kind = %K::kind(&()), "Leadership acquired, starting watcher");
            watcher.start();
        } else {
            debug!(kind = %K::kind(&()), state = ?state, "Not leader, watcher idle");
            watcher.stop().await;
            watcher.discard_pending();
        }

        tokio::select! {
            _ = token.cancelled() => break,
            changed = leadership.changed() => {
                if changed.is_err() {
                    debug!(kind = %K::kind(&()), "Leadership channel closed");
                    break;
                }
            }
        }
    }
    watcher.stop().await;
}
