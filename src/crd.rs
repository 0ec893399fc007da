//! ConfigMirror CRD
//!
//! A ConfigMirror copies one ConfigMap from its own namespace into a set of
//! target namespaces and keeps the copies in sync.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default re-sync interval in seconds
pub const DEFAULT_RESYNC_SECONDS: u64 = 300;

fn default_resync_seconds() -> u64 {
    DEFAULT_RESYNC_SECONDS
}

/// ConfigMirror keeps copies of a ConfigMap in other namespaces.
///
/// Example:
/// ```yaml
/// apiVersion: kubeops.dev/v1alpha1
/// kind: ConfigMirror
/// metadata:
///   name: shared-settings
///   namespace: platform
/// spec:
///   source: app-settings
///   targetNamespaces:
///     - team-a
///     - team-b
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubeops.dev",
    version = "v1alpha1",
    kind = "ConfigMirror",
    namespaced,
    status = "ConfigMirrorStatus",
    shortname = "cmir",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.source"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMirrorSpec {
    /// Name of the ConfigMap to copy, in the ConfigMirror's namespace
    pub source: String,

    /// Namespaces that receive a copy
    #[serde(default)]
    pub target_namespaces: Vec<String>,

    /// How often to re-copy even without changes
    #[serde(default = "default_resync_seconds")]
    pub resync_seconds: u64,
}

/// Lifecycle phase of a ConfigMirror
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MirrorPhase {
    /// Not yet synced
    #[default]
    Pending,
    /// All targets hold a current copy
    Ready,
    /// The last sync failed
    Failed,
}

/// Observed state of a ConfigMirror
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMirrorStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MirrorPhase,

    /// Namespaces holding a copy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrored: Vec<String>,

    /// Generation the status describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human-readable detail for non-ready phases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_spec_defaults() {
        let spec: ConfigMirrorSpec = serde_json::from_str(r#"{"source": "app-settings"}"#).unwrap();
        assert!(spec.target_namespaces.is_empty());
        assert_eq!(spec.resync_seconds, DEFAULT_RESYNC_SECONDS);
    }

    #[test]
    fn test_crd_metadata() {
        let crd = ConfigMirror::crd();
        assert_eq!(crd.spec.group, "kubeops.dev");
        assert_eq!(crd.spec.names.kind, "ConfigMirror");
        assert_eq!(crd.spec.names.plural, "configmirrors");
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
