//! Typed entity client
//!
//! [`EntityClient`] is the seam between the runtime and the API server: the
//! watcher streams from it, the dispatcher re-reads and updates through it.
//! [`KubeEntityClient`] implements it over `kube::Api`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::core::WatchEvent as KubeWatchEvent;
use kube::{Client, Resource};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubeops_common::Error;

use crate::entity::{entity_ref, Entity, EntityMetadata, EntityScope};

/// Watch event type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchEventType {
    /// Entity created (or seen for the first time on a fresh watch)
    Added,
    /// Entity changed
    Modified,
    /// Entity removed
    Deleted,
    /// Server-side error delivered in-band
    Error,
    /// Resource version checkpoint
    Bookmark,
}

impl WatchEventType {
    /// Lowercase label for logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Error => "error",
            Self::Bookmark => "bookmark",
        }
    }
}

/// A single event from the watch transport
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    /// Entity created
    Added(K),
    /// Entity changed
    Modified(K),
    /// Entity removed
    Deleted(K),
    /// Resource version checkpoint without an entity
    Bookmark {
        /// Version to resume from
        resource_version: String,
    },
    /// In-band server error (e.g. 410 Gone for an expired resource version)
    Error {
        /// HTTP-style status code
        code: u16,
        /// Server message
        message: String,
    },
}

impl<K: Resource> WatchEvent<K> {
    /// Type of this event
    pub fn event_type(&self) -> WatchEventType {
        match self {
            Self::Added(_) => WatchEventType::Added,
            Self::Modified(_) => WatchEventType::Modified,
            Self::Deleted(_) => WatchEventType::Deleted,
            Self::Bookmark { .. } => WatchEventType::Bookmark,
            Self::Error { .. } => WatchEventType::Error,
        }
    }

    /// Resource version carried by the event, if any
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            Self::Added(k) | Self::Modified(k) | Self::Deleted(k) => {
                k.meta().resource_version.as_deref()
            }
            Self::Bookmark { resource_version } => Some(resource_version),
            Self::Error { .. } => None,
        }
    }
}

impl<K> From<KubeWatchEvent<K>> for WatchEvent<K> {
    fn from(event: KubeWatchEvent<K>) -> Self {
        match event {
            KubeWatchEvent::Added(k) => Self::Added(k),
            KubeWatchEvent::Modified(k) => Self::Modified(k),
            KubeWatchEvent::Deleted(k) => Self::Deleted(k),
            KubeWatchEvent::Bookmark(b) => Self::Bookmark {
                resource_version: b.metadata.resource_version,
            },
            KubeWatchEvent::Error(e) => Self::Error {
                code: e.code,
                message: e.message,
            },
        }
    }
}

/// Parameters for opening one watch connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchRequest {
    /// Restrict to one namespace
    pub namespace: Option<String>,
    /// Resume point; `"0"` starts from any version with synthetic ADDED events
    pub resource_version: String,
    /// Server-side timeout in seconds
    pub timeout_secs: u32,
    /// Optional label selector
    pub label_selector: Option<String>,
}

/// Stream of watch events for one connection
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, Error>>;

/// Trait abstracting Kubernetes API operations for one entity type
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntityClient<K: Entity>: Send + Sync {
    /// Get an entity by name; `Ok(None)` when it does not exist
    async fn get<'a>(&self, name: &str, namespace: Option<&'a str>) -> Result<Option<K>, Error>;

    /// List entities, optionally within a namespace
    async fn list<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<K>, Error>;

    /// Create an entity
    async fn create(&self, entity: &K) -> Result<K, Error>;

    /// Replace an entity (optimistic concurrency through its resourceVersion)
    async fn update(&self, entity: &K) -> Result<K, Error>;

    /// Write the status subresource of an entity
    async fn update_status(&self, entity: &K) -> Result<K, Error>;

    /// Delete an entity; deleting a missing entity succeeds
    async fn delete(&self, entity: &K) -> Result<(), Error>;

    /// Open a watch connection
    async fn watch(&self, request: &WatchRequest) -> Result<WatchStream<K>, Error>;
}

/// Real client implementation over `kube::Api`
pub struct KubeEntityClient<K> {
    client: Client,
    scoped: fn(Client, Option<&str>) -> Api<K>,
    metadata: EntityMetadata,
    field_manager: String,
}

impl<K> KubeEntityClient<K>
where
    K: Entity + Resource<Scope = NamespaceResourceScope>,
{
    /// Client for a namespaced entity type
    pub fn namespaced(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            scoped: |client, namespace| match namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            },
            metadata: EntityMetadata::of::<K>(EntityScope::Namespaced),
            field_manager: field_manager.to_string(),
        }
    }
}

impl<K> KubeEntityClient<K>
where
    K: Entity + Resource<Scope = ClusterResourceScope>,
{
    /// Client for a cluster-scoped entity type
    pub fn cluster(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            scoped: |client, _| Api::all(client),
            metadata: EntityMetadata::of::<K>(EntityScope::Cluster),
            field_manager: field_manager.to_string(),
        }
    }
}

impl<K: Entity> KubeEntityClient<K> {
    /// Metadata of the entity type this client serves
    pub fn metadata(&self) -> &EntityMetadata {
        &self.metadata
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.scoped)(self.client.clone(), namespace)
    }

    fn api_for(&self, entity: &K) -> Api<K> {
        self.api(entity.meta().namespace.as_deref())
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn name_of(&self, entity: &K) -> Result<String, Error> {
        entity.meta().name.clone().ok_or_else(|| {
            Error::internal_with_context(
                format!("{} without metadata.name", self.metadata.kind),
                "client",
            )
        })
    }
}

#[async_trait]
impl<K: Entity> EntityClient<K> for KubeEntityClient<K> {
    async fn get<'a>(&self, name: &str, namespace: Option<&'a str>) -> Result<Option<K>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<K>, Error> {
        let list = self.api(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, entity: &K) -> Result<K, Error> {
        Ok(self.api_for(entity).create(&self.post_params(), entity).await?)
    }

    async fn update(&self, entity: &K) -> Result<K, Error> {
        let name = self.name_of(entity)?;
        Ok(self
            .api_for(entity)
            .replace(&name, &self.post_params(), entity)
            .await?)
    }

    async fn update_status(&self, entity: &K) -> Result<K, Error> {
        let name = self.name_of(entity)?;
        let value = serde_json::to_value(entity)
            .map_err(|e| Error::serialization_for(&self.metadata.kind, e.to_string()))?;
        let patch = json!({ "status": value.get("status").cloned().unwrap_or_default() });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        Ok(self
            .api_for(entity)
            .patch_status(&name, &params, &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(&self, entity: &K) -> Result<(), Error> {
        let name = self.name_of(entity)?;
        match self
            .api_for(entity)
            .delete(&name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(entity = %entity_ref(entity.meta()), "Entity already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn watch(&self, request: &WatchRequest) -> Result<WatchStream<K>, Error> {
        let mut params = WatchParams::default().timeout(request.timeout_secs);
        if let Some(selector) = &request.label_selector {
            params = params.labels(selector);
        }

        let stream = self
            .api(request.namespace.as_deref())
            .watch(&params, &request.resource_version)
            .await?;

        Ok(stream
            .map(|event| event.map(WatchEvent::from).map_err(Error::from))
            .boxed())
    }
}
