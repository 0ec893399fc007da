//! Last-seen snapshots used to classify watch events
//!
//! Every accepted watch event is compared against the previous snapshot of
//! the same entity. Changes confined to `status` or to
//! `metadata.finalizers` are usually the echo of the controller's own
//! writes; reporting them separately lets the dispatcher skip a full
//! reconcile instead of reacting to its own last update.
//!
//! Snapshots are stored as `serde_json::Value` trees, so the comparison is a
//! plain structural diff with an ignore list, independent of the entity type.

use std::marker::PhantomData;

use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use tracing::warn;

use crate::entity::{entity_ref, Entity};

/// Fields the API server changes on every write
pub const DEFAULT_IGNORED_PATHS: &[&str] = &["metadata.resourceVersion", "metadata.managedFields"];

const STATUS_PATH: &[&str] = &["status"];
const FINALIZERS_PATH: &[&str] = &["metadata", "finalizers"];

/// Nature of the change between an entity and its previous snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheComparisonResult {
    /// New entity, no change, or a change outside status/finalizers
    Other,
    /// Only the status subtree changed
    StatusModified,
    /// Only the finalizer list changed
    FinalizersModified,
}

/// Per-entity-type snapshot cache keyed by UID
pub struct ResourceCache<K> {
    snapshots: DashMap<String, Value>,
    ignored: Vec<Vec<String>>,
    _entity: PhantomData<fn() -> K>,
}

impl<K: Entity> Default for ResourceCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Entity> ResourceCache<K> {
    /// Cache ignoring [`DEFAULT_IGNORED_PATHS`]
    pub fn new() -> Self {
        Self::with_ignored_paths(DEFAULT_IGNORED_PATHS)
    }

    /// Cache ignoring the given dotted paths (e.g. `metadata.annotations`)
    pub fn with_ignored_paths(paths: &[&str]) -> Self {
        Self {
            snapshots: DashMap::new(),
            ignored: paths
                .iter()
                .map(|p| p.split('.').map(str::to_string).collect())
                .collect(),
            _entity: PhantomData,
        }
    }

    /// Classify `entity` against its snapshot, then replace the snapshot
    pub fn upsert(&self, entity: &K) -> CacheComparisonResult {
        let key = cache_key(entity.meta());
        let current = match serde_json::to_value(entity) {
            Ok(value) => value,
            Err(e) => {
                warn!(entity = %entity_ref(entity.meta()), error = %e, "Failed to snapshot entity");
                self.snapshots.remove(&key);
                return CacheComparisonResult::Other;
            }
        };

        let result = match self.snapshots.get(&key) {
            Some(previous) => classify(&self.diff_values(&previous, &current)),
            None => CacheComparisonResult::Other,
        };

        self.snapshots.insert(key, current);
        result
    }

    /// Dotted paths that differ from the snapshot; `None` if not cached
    ///
    /// An empty list means the entity is unchanged apart from ignored fields.
    pub fn diff(&self, entity: &K) -> Option<Vec<String>> {
        let previous = self.snapshots.get(&cache_key(entity.meta()))?;
        let current = serde_json::to_value(entity).ok()?;
        Some(
            self.diff_values(&previous, &current)
                .into_iter()
                .map(|path| path.join("."))
                .collect(),
        )
    }

    /// Drop the snapshot of `entity`; returns whether one existed
    pub fn remove(&self, entity: &K) -> bool {
        self.snapshots.remove(&cache_key(entity.meta())).is_some()
    }

    /// Drop every snapshot
    pub fn clear(&self) {
        self.snapshots.clear();
    }

    /// Number of cached snapshots
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn diff_values(&self, previous: &Value, current: &Value) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        diff_into(previous, current, &mut path, &self.ignored, &mut out);
        out
    }
}

/// UID when present, otherwise `namespace/name`
fn cache_key(meta: &ObjectMeta) -> String {
    meta.uid.clone().unwrap_or_else(|| entity_ref(meta))
}

fn classify(paths: &[Vec<String>]) -> CacheComparisonResult {
    if paths.is_empty() {
        return CacheComparisonResult::Other;
    }
    if paths.iter().all(|p| starts_with(p, STATUS_PATH)) {
        return CacheComparisonResult::StatusModified;
    }
    if paths.iter().all(|p| starts_with(p, FINALIZERS_PATH)) {
        return CacheComparisonResult::FinalizersModified;
    }
    CacheComparisonResult::Other
}

fn starts_with(path: &[String], prefix: &[&str]) -> bool {
    path.len() >= prefix.len() && path.iter().zip(prefix).all(|(a, b)| a == b)
}

/// Collect the paths where `a` and `b` differ
///
/// Objects are walked key by key (a missing key equals `null`); arrays and
/// scalars are compared as leaves.
fn diff_into(
    a: &Value,
    b: &Value,
    path: &mut Vec<String>,
    ignored: &[Vec<String>],
    out: &mut Vec<Vec<String>>,
) {
    if ignored.iter().any(|i| i == path) {
        return;
    }

    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let mut keys: Vec<&String> = left.keys().chain(right.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                path.push(key.clone());
                diff_into(
                    left.get(key).unwrap_or(&Value::Null),
                    right.get(key).unwrap_or(&Value::Null),
                    path,
                    ignored,
                    out,
                );
                path.pop();
            }
        }
        _ if a != b => out.push(path.clone()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{widget, with_finalizers, Widget, WidgetStatus};
    use rstest::rstest;

    fn cache_with(entity: &Widget) -> ResourceCache<Widget> {
        let cache = ResourceCache::new();
        assert_eq!(cache.upsert(entity), CacheComparisonResult::Other);
        cache
    }

    #[test]
    fn test_new_entity_is_other() {
        let cache = ResourceCache::<Widget>::new();
        assert_eq!(cache.upsert(&widget("ns", "a")), CacheComparisonResult::Other);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_identical_reupsert_is_other_with_empty_diff() {
        let w = widget("ns", "a");
        let cache = cache_with(&w);

        assert_eq!(cache.diff(&w), Some(vec![]));
        assert_eq!(cache.upsert(&w), CacheComparisonResult::Other);
    }

    #[test]
    fn test_volatile_fields_are_ignored() {
        let w = widget("ns", "a");
        let cache = cache_with(&w);

        let mut bumped = w.clone();
        bumped.metadata.resource_version = Some("999".to_string());
        bumped.metadata.managed_fields = Some(vec![Default::default()]);

        assert_eq!(cache.diff(&bumped), Some(vec![]));
    }

    #[rstest]
    #[case::status_only(
        |w: &mut Widget| w.status = Some(WidgetStatus { ready: true }),
        CacheComparisonResult::StatusModified
    )]
    #[case::finalizers_only(
        |w: &mut Widget| w.metadata.finalizers = Some(vec!["widgets.testing/cleanup".to_string()]),
        CacheComparisonResult::FinalizersModified
    )]
    #[case::spec_change(
        |w: &mut Widget| w.spec.replicas = 3,
        CacheComparisonResult::Other
    )]
    #[case::labels_change(
        |w: &mut Widget| w.metadata.labels = Some([("tier".to_string(), "web".to_string())].into()),
        CacheComparisonResult::Other
    )]
    #[case::status_and_spec(
        |w: &mut Widget| {
            w.status = Some(WidgetStatus { ready: true });
            w.spec.image = "nginx:1.28".to_string();
        },
        CacheComparisonResult::Other
    )]
    #[case::status_and_finalizers(
        |w: &mut Widget| {
            w.status = Some(WidgetStatus { ready: true });
            w.metadata.finalizers = Some(vec!["x".to_string()]);
        },
        CacheComparisonResult::Other
    )]
    fn test_classification(
        #[case] mutate: fn(&mut Widget),
        #[case] expected: CacheComparisonResult,
    ) {
        let original = widget("ns", "a");
        let cache = cache_with(&original);

        let mut changed = original.clone();
        changed.metadata.resource_version = Some("2".to_string());
        mutate(&mut changed);

        assert_eq!(cache.upsert(&changed), expected);
    }

    #[test]
    fn test_status_change_after_existing_status() {
        let mut w = widget("ns", "a");
        w.status = Some(WidgetStatus { ready: false });
        let cache = cache_with(&w);

        w.status = Some(WidgetStatus { ready: true });
        assert_eq!(cache.diff(&w), Some(vec!["status.ready".to_string()]));
        assert_eq!(cache.upsert(&w), CacheComparisonResult::StatusModified);
    }

    #[test]
    fn test_finalizer_removal_is_finalizers_modified() {
        let w = with_finalizers(widget("ns", "a"), &["a", "b"]);
        let cache = cache_with(&w);

        let fewer = with_finalizers(w.clone(), &["b"]);
        assert_eq!(cache.upsert(&fewer), CacheComparisonResult::FinalizersModified);
    }

    #[test]
    fn test_snapshot_is_replaced_after_classification() {
        let w = widget("ns", "a");
        let cache = cache_with(&w);

        let mut ready = w.clone();
        ready.status = Some(WidgetStatus { ready: true });
        assert_eq!(cache.upsert(&ready), CacheComparisonResult::StatusModified);
        // Same status again: compared against the replaced snapshot
        assert_eq!(cache.diff(&ready), Some(vec![]));
    }

    #[test]
    fn test_remove_and_clear() {
        let a = widget("ns", "a");
        let b = widget("ns", "b");
        let cache = ResourceCache::new();
        cache.upsert(&a);
        cache.upsert(&b);

        assert!(cache.remove(&a));
        assert!(!cache.remove(&a));
        assert_eq!(cache.diff(&a), None);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entities_without_uid_key_by_name() {
        let mut a = widget("ns1", "same");
        let mut b = widget("ns2", "same");
        a.metadata.uid = None;
        b.metadata.uid = None;

        let cache = ResourceCache::new();
        cache.upsert(&a);
        cache.upsert(&b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_custom_ignore_list() {
        let w = widget("ns", "a");
        let cache = ResourceCache::with_ignored_paths(&["metadata.resourceVersion", "spec.image"]);
        cache.upsert(&w);

        let mut changed = w.clone();
        changed.spec.image = "busybox".to_string();
        assert_eq!(cache.diff(&changed), Some(vec![]));
    }
}
