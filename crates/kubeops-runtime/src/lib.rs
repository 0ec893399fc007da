//! Watch-and-reconcile pipeline for kubeops controllers
//!
//! Data flows one way per entity type:
//!
//! ```text
//! API server -> ResourceWatcher -> ResourceCache (classify) -> TimedEntityQueue
//!            -> Dispatcher -> EntityController -> (requeue) -> TimedEntityQueue
//! ```
//!
//! [`Operator`] wires these together, optionally gated on leader election.

pub mod cache;
pub mod client;
pub mod controller;
pub mod dispatch;
pub mod election;
pub mod entity;
pub mod leader_aware;
pub mod operator;
pub mod queue;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use cache::{CacheComparisonResult, ResourceCache};
pub use client::{EntityClient, KubeEntityClient, WatchEvent, WatchEventType, WatchRequest};
pub use controller::{Action, EntityController, EntityFinalizer};
pub use dispatch::Dispatcher;
pub use election::LeaderElectionBackgroundService;
pub use entity::{Entity, EntityMetadata, EntityScope};
pub use leader_aware::LeaderAwareResourceWatcher;
pub use operator::{Operator, Registration};
pub use queue::{EntityRequeue, QueueEntry, ReconcileTrigger, TimedEntityQueue};
pub use watcher::{ResourceWatcher, WatcherState};
