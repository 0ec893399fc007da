//! ConfigMirror controller and cleanup finalizer

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use kubeops_common::Error;
use kubeops_runtime::{Action, EntityClient, EntityController, EntityFinalizer};

use crate::crd::{ConfigMirror, ConfigMirrorStatus, MirrorPhase};

/// Field manager for server-side apply of copies
pub const FIELD_MANAGER: &str = "kubeops-config-mirror";

/// Finalizer that removes the copies before a ConfigMirror goes away
pub const CLEANUP_FINALIZER: &str = "kubeops.dev/mirror-cleanup";

/// Label marking a ConfigMap as a copy owned by a ConfigMirror
pub const MIRROR_LABEL: &str = "kubeops.dev/mirror";

/// Label marking resources managed by kubeops
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Retry delay while the source ConfigMap is missing
const MISSING_SOURCE_RETRY: Duration = Duration::from_secs(30);

/// Label value identifying `mirror`: `<namespace>.<name>`
pub fn mirror_id(mirror: &ConfigMirror) -> String {
    format!("{}.{}", mirror.namespace().unwrap_or_default(), mirror.name_any())
}

/// The copy of `source` that `mirror` wants in `namespace`
pub fn mirror_copy(source: &ConfigMap, mirror: &ConfigMirror, namespace: &str) -> ConfigMap {
    let mut labels = BTreeMap::new();
    labels.insert(MIRROR_LABEL.to_string(), mirror_id(mirror));
    labels.insert(MANAGED_BY_LABEL.to_string(), "kubeops".to_string());

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(source.name_any()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: source.data.clone(),
        binary_data: source.binary_data.clone(),
        immutable: source.immutable,
    }
}

/// Status describing a successful sync into `mirrored`
pub fn ready_status(mirror: &ConfigMirror, mirrored: Vec<String>) -> ConfigMirrorStatus {
    ConfigMirrorStatus {
        phase: MirrorPhase::Ready,
        mirrored,
        observed_generation: mirror.metadata.generation,
        message: None,
    }
}

/// Status describing a sync that cannot proceed
pub fn pending_status(mirror: &ConfigMirror, message: impl Into<String>) -> ConfigMirrorStatus {
    ConfigMirrorStatus {
        phase: MirrorPhase::Pending,
        mirrored: Vec::new(),
        observed_generation: mirror.metadata.generation,
        message: Some(message.into()),
    }
}

/// Copies the source ConfigMap into every target namespace
pub struct ConfigMirrorController {
    client: Client,
    mirrors: Arc<dyn EntityClient<ConfigMirror>>,
}

impl ConfigMirrorController {
    /// Create a controller writing status through `mirrors`
    pub fn new(client: Client, mirrors: Arc<dyn EntityClient<ConfigMirror>>) -> Self {
        Self { client, mirrors }
    }

    async fn set_status(&self, mirror: &ConfigMirror, status: ConfigMirrorStatus) -> Result<(), Error> {
        if mirror.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = mirror.clone();
        updated.status = Some(status);
        self.mirrors.update_status(&updated).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityController<ConfigMirror> for ConfigMirrorController {
    async fn reconcile(&self, mirror: &ConfigMirror) -> Result<Action, Error> {
        let namespace = mirror
            .namespace()
            .ok_or_else(|| Error::reconcile(mirror.name_any(), "ConfigMirror without namespace"))?;
        let source_name = &mirror.spec.source;

        let sources: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        let Some(source) = sources.get_opt(source_name).await? else {
            warn!(mirror = %mirror_id(mirror), source = %source_name, "Source ConfigMap not found");
            self.set_status(mirror, pending_status(mirror, format!("ConfigMap {} not found", source_name)))
                .await?;
            return Ok(Action::requeue(MISSING_SOURCE_RETRY));
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut mirrored = Vec::with_capacity(mirror.spec.target_namespaces.len());
        for target in &mirror.spec.target_namespaces {
            if *target == namespace {
                debug!(mirror = %mirror_id(mirror), "Skipping source namespace");
                continue;
            }
            let copy = mirror_copy(&source, mirror, target);
            Api::<ConfigMap>::namespaced(self.client.clone(), target)
                .patch(source_name, &params, &Patch::Apply(&copy))
                .await?;
            mirrored.push(target.clone());
        }

        info!(mirror = %mirror_id(mirror), targets = mirrored.len(), "ConfigMap mirrored");
        self.set_status(mirror, ready_status(mirror, mirrored)).await?;
        Ok(Action::requeue(Duration::from_secs(mirror.spec.resync_seconds)))
    }

    async fn deleted(&self, mirror: &ConfigMirror) -> Result<(), Error> {
        info!(mirror = %mirror_id(mirror), "ConfigMirror deleted");
        Ok(())
    }
}

/// Deletes every copy a ConfigMirror created
pub struct MirrorCleanup {
    client: Client,
}

impl MirrorCleanup {
    /// Create the finalizer
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EntityFinalizer<ConfigMirror> for MirrorCleanup {
    fn identifier(&self) -> String {
        CLEANUP_FINALIZER.to_string()
    }

    async fn finalize(&self, mirror: &ConfigMirror) -> Result<(), Error> {
        let selector = format!("{}={}", MIRROR_LABEL, mirror_id(mirror));
        let copies: Api<ConfigMap> = Api::all(self.client.clone());
        let list = copies.list(&ListParams::default().labels(&selector)).await?;

        for copy in list.items {
            let Some(namespace) = copy.namespace() else {
                continue;
            };
            let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
            match api.delete(&copy.name_any(), &DeleteParams::default()).await {
                Ok(_) => debug!(namespace = %namespace, name = %copy.name_any(), "Deleted copy"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(mirror = %mirror_id(mirror), "Copies removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConfigMirrorSpec;

    fn mirror() -> ConfigMirror {
        let mut mirror = ConfigMirror::new(
            "shared-settings",
            ConfigMirrorSpec {
                source: "app-settings".to_string(),
                target_namespaces: vec!["team-a".to_string(), "team-b".to_string()],
                resync_seconds: 60,
            },
        );
        mirror.metadata.namespace = Some("platform".to_string());
        mirror.metadata.generation = Some(3);
        mirror
    }

    fn source() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("app-settings".to_string()),
                namespace: Some("platform".to_string()),
                resource_version: Some("17".to_string()),
                uid: Some("source-uid".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("LOG_LEVEL".to_string(), "debug".to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn test_copy_targets_namespace_and_drops_server_fields() {
        let copy = mirror_copy(&source(), &mirror(), "team-a");

        assert_eq!(copy.metadata.name.as_deref(), Some("app-settings"));
        assert_eq!(copy.metadata.namespace.as_deref(), Some("team-a"));
        assert!(copy.metadata.resource_version.is_none());
        assert!(copy.metadata.uid.is_none());
        assert_eq!(copy.data, source().data);
    }

    #[test]
    fn test_copy_is_labelled_with_owner() {
        let copy = mirror_copy(&source(), &mirror(), "team-b");
        let labels = copy.metadata.labels.unwrap();

        assert_eq!(labels.get(MIRROR_LABEL).map(String::as_str), Some("platform.shared-settings"));
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some("kubeops"));
    }

    #[test]
    fn test_statuses_carry_generation() {
        let m = mirror();
        let ready = ready_status(&m, vec!["team-a".to_string()]);
        assert_eq!(ready.phase, MirrorPhase::Ready);
        assert_eq!(ready.observed_generation, Some(3));

        let pending = pending_status(&m, "ConfigMap app-settings not found");
        assert_eq!(pending.phase, MirrorPhase::Pending);
        assert!(pending.mirrored.is_empty());
        assert!(pending.message.unwrap().contains("app-settings"));
    }
}
