//! Operator host
//!
//! Wires one watcher, cache, queue and dispatcher per registered entity type,
//! optionally gated on a background leader election, and runs them until a
//! cancellation token fires.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kubeops_common::{Error, LeaderElector, LeadershipState, LeaseLock, OperatorSettings};

use crate::cache::ResourceCache;
use crate::client::EntityClient;
use crate::controller::{EntityController, EntityFinalizer};
use crate::dispatch::Dispatcher;
use crate::election::LeaderElectionBackgroundService;
use crate::entity::Entity;
use crate::leader_aware::LeaderAwareResourceWatcher;
use crate::queue::{EntityRequeue, TimedEntityQueue};
use crate::watcher::ResourceWatcher;

/// Everything the host needs to run one entity type
pub struct Registration<K: Entity> {
    client: Arc<dyn EntityClient<K>>,
    queue: Arc<TimedEntityQueue<K>>,
    cache: Arc<ResourceCache<K>>,
    controller: Option<Arc<dyn EntityController<K>>>,
    finalizers: Vec<Arc<dyn EntityFinalizer<K>>>,
}

impl<K: Entity> Registration<K> {
    /// Start a registration for entities served by `client`
    pub fn new(client: Arc<dyn EntityClient<K>>) -> Self {
        Self {
            client,
            queue: Arc::new(TimedEntityQueue::new()),
            cache: Arc::new(ResourceCache::new()),
            controller: None,
            finalizers: Vec::new(),
        }
    }

    /// Requeue handle for the controller being registered
    pub fn requeue_handle(&self) -> EntityRequeue<K> {
        self.queue.requeue_handle()
    }

    /// Use a cache with a custom ignore list
    pub fn ignored_paths(mut self, paths: &[&str]) -> Self {
        self.cache = Arc::new(ResourceCache::with_ignored_paths(paths));
        self
    }

    /// Set the controller
    pub fn controller(mut self, controller: impl EntityController<K> + 'static) -> Self {
        self.controller = Some(Arc::new(controller));
        self
    }

    /// Add a finalizer; finalizers run in registration order
    pub fn finalizer(mut self, finalizer: impl EntityFinalizer<K> + 'static) -> Self {
        self.finalizers.push(Arc::new(finalizer));
        self
    }
}

/// A registered entity type with its type erased
#[async_trait]
trait Managed: Send + Sync {
    fn kind(&self) -> String;

    fn start(
        &mut self,
        settings: &OperatorSettings,
        leadership: Option<watch::Receiver<LeadershipState>>,
        token: CancellationToken,
    ) -> Result<(), Error>;

    async fn stop(&mut self);
}

enum GatedWatcher<K: Entity> {
    Always(ResourceWatcher<K>),
    Leader(LeaderAwareResourceWatcher<K>),
}

impl<K: Entity> GatedWatcher<K> {
    fn start(&self) {
        match self {
            Self::Always(watcher) => watcher.start(),
            Self::Leader(watcher) => watcher.start(),
        }
    }

    async fn stop(&self) {
        match self {
            Self::Always(watcher) => watcher.stop().await,
            Self::Leader(watcher) => watcher.stop().await,
        }
    }
}

struct ManagedEntity<K: Entity> {
    client: Arc<dyn EntityClient<K>>,
    queue: Arc<TimedEntityQueue<K>>,
    cache: Arc<ResourceCache<K>>,
    controller: Arc<dyn EntityController<K>>,
    finalizers: Vec<Arc<dyn EntityFinalizer<K>>>,
    watcher: Option<GatedWatcher<K>>,
    dispatch: Option<(CancellationToken, JoinHandle<()>)>,
}

#[async_trait]
impl<K: Entity> Managed for ManagedEntity<K> {
    fn kind(&self) -> String {
        K::kind(&()).to_string()
    }

    fn start(
        &mut self,
        settings: &OperatorSettings,
        leadership: Option<watch::Receiver<LeadershipState>>,
        token: CancellationToken,
    ) -> Result<(), Error> {
        let entries = self.queue.consume(token.clone())?;
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&self.client),
            Arc::clone(&self.controller),
            self.finalizers.clone(),
            self.queue.requeue_handle(),
            settings,
        );
        if let Some(leadership) = &leadership {
            dispatcher = dispatcher.with_leadership(leadership.clone());
        }
        self.dispatch = Some((token, tokio::spawn(dispatcher.run(entries))));

        let watcher = ResourceWatcher::new(
            Arc::clone(&self.client),
            Arc::clone(&self.cache),
            Arc::clone(&self.queue),
            settings,
        );
        let watcher = match leadership {
            Some(leadership) => {
                GatedWatcher::Leader(LeaderAwareResourceWatcher::new(watcher, leadership))
            }
            None => GatedWatcher::Always(watcher),
        };
        watcher.start();
        self.watcher = Some(watcher);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        if let Some((token, handle)) = self.dispatch.take() {
            token.cancel();
            if let Err(e) = handle.await {
                error!(kind = %self.kind(), error = %e, "Dispatcher task failed");
            }
        }
    }
}

/// Runs registered controllers until cancelled
pub struct Operator {
    settings: OperatorSettings,
    election: Option<LeaderElectionBackgroundService>,
    entities: Vec<Box<dyn Managed>>,
}

impl Operator {
    /// Host using a Lease in the cluster for leader election when enabled
    pub fn new(client: Client, settings: OperatorSettings) -> Result<Self, Error> {
        let lock: Option<Arc<dyn LeaseLock>> = if settings.leader_election {
            Some(Arc::new(LeaderElector::from_settings(client, &settings)))
        } else {
            None
        };
        Self::with_lease_lock(settings, lock)
    }

    /// Host using `lock` for leader election; `None` runs without election
    pub fn with_lease_lock(
        settings: OperatorSettings,
        lock: Option<Arc<dyn LeaseLock>>,
    ) -> Result<Self, Error> {
        settings.validate()?;
        let election = lock.map(|lock| LeaderElectionBackgroundService::new(lock, &settings));
        Ok(Self {
            settings,
            election,
            entities: Vec::new(),
        })
    }

    /// Settings the host was built with
    pub fn settings(&self) -> &OperatorSettings {
        &self.settings
    }

    /// Register an entity type
    pub fn register<K: Entity>(mut self, registration: Registration<K>) -> Result<Self, Error> {
        let kind = K::kind(&()).to_string();
        let controller = registration.controller.ok_or_else(|| {
            Error::configuration(format!("no controller registered for {}", kind))
        })?;
        if self.entities.iter().any(|e| e.kind() == kind) {
            return Err(Error::configuration(format!("{} registered twice", kind)));
        }

        info!(kind = %kind, finalizers = registration.finalizers.len(), "Registered controller");
        self.entities.push(Box::new(ManagedEntity {
            client: registration.client,
            queue: registration.queue,
            cache: registration.cache,
            controller,
            finalizers: registration.finalizers,
            watcher: None,
            dispatch: None,
        }));
        Ok(self)
    }

    /// Start everything and block until `token` is cancelled
    ///
    /// Shutdown runs in reverse start order: watchers and dispatchers first,
    /// then the election service, which releases the lease if held.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), Error> {
        let leadership = self.election.as_ref().map(|election| {
            election.start();
            election.subscribe()
        });

        for index in 0..self.entities.len() {
            let entity = &mut self.entities[index];
            info!(kind = %entity.kind(), "Starting controller");
            if let Err(e) = entity.start(&self.settings, leadership.clone(), token.child_token()) {
                error!(kind = %entity.kind(), error = %e, "Controller failed to start");
                self.shutdown(index).await;
                return Err(e);
            }
        }
        info!(
            operator = %self.settings.name,
            controllers = self.entities.len(),
            leader_election = self.election.is_some(),
            "Operator running"
        );

        token.cancelled().await;
        info!(operator = %self.settings.name, "Shutting down");
        let started = self.entities.len();
        self.shutdown(started).await;
        info!(operator = %self.settings.name, "Operator stopped");
        Ok(())
    }

    /// Stop the first `started` entities in reverse order, then the election
    async fn shutdown(&mut self, started: usize) {
        for entity in self.entities[..started].iter_mut().rev() {
            entity.stop().await;
        }
        if let Some(election) = &self.election {
            election.stop().await;
        }
    }
}
