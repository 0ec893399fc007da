//! Background leader election
//!
//! Drives a [`LeaseLock`] from a spawned task and publishes the resulting
//! [`LeadershipState`] over a `watch` channel. `start()` never waits for
//! the first acquisition; watchers learn about leadership through the
//! channel instead.
//!
//! A candidate retries every `retry_interval`; a leader renews every
//! `renew_interval`. A failed or rejected renewal steps down to candidate.
//! Lock errors are logged and retried for as long as the service runs.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kubeops_common::{metrics, LeadershipState, LeaseLock, OperatorSettings};

struct ElectionTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the lease protocol in the background
pub struct LeaderElectionBackgroundService {
    lock: Arc<dyn LeaseLock>,
    lease_name: String,
    renew_interval: Duration,
    retry_interval: Duration,
    state: Arc<watch::Sender<LeadershipState>>,
    task: Mutex<Option<ElectionTask>>,
}

impl LeaderElectionBackgroundService {
    /// Create a stopped service for `lock`
    pub fn new(lock: Arc<dyn LeaseLock>, settings: &OperatorSettings) -> Self {
        let (state, _) = watch::channel(LeadershipState::None);
        Self {
            lock,
            lease_name: settings.lease_name.clone(),
            renew_interval: settings.renew_interval,
            retry_interval: settings.retry_interval,
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    /// Receiver for leadership changes
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    /// Current leadership
    pub fn state(&self) -> LeadershipState {
        *self.state.borrow()
    }

    /// Spawn the election loop and return immediately
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        info!(lease = %self.lease_name, "Starting leader election");
        let token = CancellationToken::new();
        let election = Election {
            lock: Arc::clone(&self.lock),
            lease_name: self.lease_name.clone(),
            renew_interval: self.renew_interval,
            retry_interval: self.retry_interval,
            state: Arc::clone(&self.state),
        };
        let handle = tokio::spawn(election.run(token.clone()));
        *task = Some(ElectionTask { token, handle });
    }

    /// Stop the loop, release the lease if held and publish `None`
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        task.token.cancel();
        if let Err(e) = task.handle.await {
            error!(lease = %self.lease_name, error = %e, "Election task failed");
        }

        if self.state().is_leader() {
            match self.lock.release().await {
                Ok(()) => info!(lease = %self.lease_name, "Leadership released"),
                Err(e) => warn!(lease = %self.lease_name, error = %e, "Failed to release lease"),
            }
        }
        self.state.send_replace(LeadershipState::None);
        metrics::record_leadership(&self.lease_name, false);
    }
}

impl Drop for LeaderElectionBackgroundService {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.token.cancel();
            task.handle.abort();
        }
    }
}

struct Election {
    lock: Arc<dyn LeaseLock>,
    lease_name: String,
    renew_interval: Duration,
    retry_interval: Duration,
    state: Arc<watch::Sender<LeadershipState>>,
}

impl Election {
    async fn run(self, token: CancellationToken) {
        self.transition(LeadershipState::Candidate);

        loop {
            let leading = self.state.borrow().is_leader();
            let attempt = tokio::select! {
                _ = token.cancelled() => break,
                attempt = self.lock.try_acquire_or_renew() => attempt,
            };

            match attempt {
                Ok(true) if !leading => {
                    info!(lease = %self.lease_name, "Leadership acquired");
                    self.transition(LeadershipState::Leader);
                }
                Ok(true) => {}
                Ok(false) if leading => {
                    warn!(lease = %self.lease_name, "Leadership lost");
                    self.transition(LeadershipState::Candidate);
                }
                Ok(false) => {
                    debug!(
                        lease = %self.lease_name,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) if leading => {
                    warn!(lease = %self.lease_name, error = %e, "Lease renewal failed, stepping down");
                    self.transition(LeadershipState::Candidate);
                }
                Err(e) => {
                    warn!(
                        lease = %self.lease_name,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }

            let wait = if self.state.borrow().is_leader() {
                self.renew_interval
            } else {
                self.retry_interval
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn transition(&self, state: LeadershipState) {
        self.state.send_replace(state);
        metrics::record_leadership(&self.lease_name, state.is_leader());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::eventually;
    use async_trait::async_trait;
    use kubeops_common::Error;
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        Lock {}

        #[async_trait]
        impl LeaseLock for Lock {
            async fn try_acquire_or_renew(&self) -> Result<bool, Error>;
            async fn release(&self) -> Result<(), Error>;
        }
    }

    /// Lock answering attempt `n` (0-based) with `script(n)`
    fn scripted<F>(script: F, releases: usize) -> (MockLock, Arc<AtomicUsize>)
    where
        F: Fn(usize) -> Result<bool, Error> + Send + 'static,
    {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let mut lock = MockLock::new();
        lock.expect_try_acquire_or_renew()
            .returning(move || script(counter.fetch_add(1, Ordering::SeqCst)));
        lock.expect_release().times(releases).returning(|| Ok(()));
        (lock, attempts)
    }

    fn service(lock: MockLock) -> LeaderElectionBackgroundService {
        LeaderElectionBackgroundService::new(Arc::new(lock), &OperatorSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_returns_before_acquisition() {
        let (lock, _) = scripted(|_| Ok(true), 1);
        let service = service(lock);

        service.start();
        assert_eq!(service.state(), LeadershipState::None);

        eventually(|| service.state().is_leader()).await;
        service.stop().await;
        assert_eq!(service.state(), LeadershipState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidate_retries_on_interval() {
        let (lock, attempts) = scripted(|_| Ok(false), 0);
        let service = service(lock);

        service.start();
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        assert_eq!(service.state(), LeadershipState::Candidate);
        // t = 0, 2, 4 with the default 2s retry interval
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_retried_until_acquired() {
        let (lock, _) = scripted(
            |n| {
                if n < 2 {
                    Err(Error::leader_election("kubeops-operator", "apiserver unavailable"))
                } else {
                    Ok(true)
                }
            },
            1,
        );
        let service = service(lock);
        let mut states = service.subscribe();

        service.start();
        states.wait_for(|s| s.is_leader()).await.unwrap();
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_renewal_steps_down() {
        let (lock, _) = scripted(|n| Ok(n == 0), 0);
        let service = service(lock);
        let mut states = service.subscribe();

        service.start();
        states.wait_for(|s| s.is_leader()).await.unwrap();
        states
            .wait_for(|s| *s == LeadershipState::Candidate)
            .await
            .unwrap();

        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_steps_down() {
        let (lock, _) = scripted(
            |n| {
                if n == 0 {
                    Ok(true)
                } else {
                    Err(Error::leader_election("kubeops-operator", "timeout"))
                }
            },
            0,
        );
        let service = service(lock);
        let mut states = service.subscribe();

        service.start();
        states.wait_for(|s| s.is_leader()).await.unwrap();
        states
            .wait_for(|s| *s == LeadershipState::Candidate)
            .await
            .unwrap();

        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_drop_is_safe() {
        let (lock, _) = scripted(|_| Ok(false), 0);
        let service = service(lock);

        service.stop().await;
        service.start();
        eventually(|| service.state() == LeadershipState::Candidate).await;
        service.stop().await;
        service.stop().await;
        drop(service);

        let (lock, _) = scripted(|_| Ok(false), 0);
        let running = self::service(lock);
        running.start();
        drop(running);
    }
}
