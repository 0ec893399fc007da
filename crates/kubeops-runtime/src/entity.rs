//! Entity trait and metadata descriptor
//!
//! Anything kube-rs can serialize and address without a dynamic type is an
//! [`Entity`]. [`EntityMetadata`] is computed once per type at registration
//! and used for logging, metrics labels and API paths.

use std::fmt::{self, Debug, Display};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A Kubernetes resource the runtime can watch, cache and reconcile
pub trait Entity:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Entity for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Whether an entity lives in a namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityScope {
    /// Namespaced resource
    Namespaced,
    /// Cluster-scoped resource
    Cluster,
}

/// Group/version/kind/plural descriptor for an entity type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityMetadata {
    /// Kind, e.g. `ConfigMirror`
    pub kind: String,
    /// List kind, e.g. `ConfigMirrorList`
    pub list_kind: String,
    /// API group; empty for the core group
    pub group: String,
    /// API version, e.g. `v1alpha1`
    pub version: String,
    /// Plural resource name used in URLs
    pub plural: String,
    /// Namespaced or cluster-scoped
    pub scope: EntityScope,
}

impl EntityMetadata {
    /// Describe `K` with the given scope
    pub fn of<K: Entity>(scope: EntityScope) -> Self {
        let kind = K::kind(&()).to_string();
        Self {
            list_kind: format!("{}List", kind),
            kind,
            group: K::group(&()).to_string(),
            version: K::version(&()).to_string(),
            plural: K::plural(&()).to_string(),
            scope,
        }
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Collection URL, optionally restricted to a namespace
    pub fn url_path(&self, namespace: Option<&str>) -> String {
        let prefix = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        match (self.scope, namespace) {
            (EntityScope::Namespaced, Some(ns)) => {
                format!("{}/namespaces/{}/{}", prefix, ns, self.plural)
            }
            _ => format!("{}/{}", prefix, self.plural),
        }
    }
}

impl Display for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.api_version())
    }
}

/// `namespace/name` (or `name` for cluster-scoped entities) for logs and errors
pub fn entity_ref(meta: &ObjectMeta) -> String {
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

/// Whether the API server has marked the entity for deletion
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use k8s_openapi::api::apps::v1::Deployment;

    #[test]
    fn test_core_group_metadata() {
        let meta = EntityMetadata::of::<ConfigMap>(EntityScope::Namespaced);
        assert_eq!(meta.kind, "ConfigMap");
        assert_eq!(meta.list_kind, "ConfigMapList");
        assert_eq!(meta.group, "");
        assert_eq!(meta.api_version(), "v1");
        assert_eq!(meta.url_path(Some("ns1")), "/api/v1/namespaces/ns1/configmaps");
        assert_eq!(meta.url_path(None), "/api/v1/configmaps");
    }

    #[test]
    fn test_grouped_metadata() {
        let meta = EntityMetadata::of::<Deployment>(EntityScope::Namespaced);
        assert_eq!(meta.api_version(), "apps/v1");
        assert_eq!(
            meta.url_path(Some("default")),
            "/apis/apps/v1/namespaces/default/deployments"
        );
        assert_eq!(meta.to_string(), "Deployment.apps/v1");
    }

    #[test]
    fn test_cluster_scope_ignores_namespace() {
        let meta = EntityMetadata::of::<Namespace>(EntityScope::Cluster);
        assert_eq!(meta.url_path(Some("ignored")), "/api/v1/namespaces");
    }

    #[test]
    fn test_entity_ref_formats() {
        let namespaced = ObjectMeta {
            name: Some("secret-name".to_string()),
            namespace: Some("app-ns1".to_string()),
            ..Default::default()
        };
        assert_eq!(entity_ref(&namespaced), "app-ns1/secret-name");

        let cluster = ObjectMeta {
            name: Some("node-1".to_string()),
            ..Default::default()
        };
        assert_eq!(entity_ref(&cluster), "node-1");
        assert!(!is_deleting(&cluster));
    }
}
