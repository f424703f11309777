//! Recursive descent of a JSON value into the state tree
//!
//! Every nested object and array element is walked in its own task, tracked
//! by the `TaskTracker` of the `walk` call that started it. Scalar fields of
//! one object are materialized inline by the task walking that object.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::melt::cache::{LeafDecision, TypeCache};
use crate::melt::detect;
use crate::melt::store::TreeStore;
use crate::melt::types::{Labels, NodeDescriptor, TreeNode, WalkOptions};
use crate::melt::units;

/// Walks JSON documents into a tree store.
///
/// Cheap to clone; clones share the cache and the store. Create one per
/// process and keep it for the process lifetime.
pub struct Melter<S: TreeStore + 'static> {
    shared: Arc<Shared<S>>,
}

impl<S: TreeStore + 'static> Clone for Melter<S> {
    fn clone(&self) -> Self {
        Melter {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// State shared by all tasks of all walks
pub(crate) struct Shared<S> {
    pub(crate) store: Arc<S>,
    pub(crate) cache: TypeCache,
}

/// The task group of one `walk` call
#[must_use = "a walk keeps running in the background; call `wait` to await it"]
pub struct WalkHandle {
    tracker: TaskTracker,
}

impl WalkHandle {
    /// Wait until every node of the walk has been handled
    pub async fn wait(self) {
        self.tracker.wait().await;
    }

    /// Number of tasks still running
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }
}

impl<S: TreeStore + 'static> Melter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Melter {
            shared: Arc::new(Shared {
                store,
                cache: TypeCache::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    pub fn cache(&self) -> &TypeCache {
        &self.shared.cache
    }

    /// Start walking `value` into the tree at `path`.
    ///
    /// Returns immediately; nodes are materialized in the background. Must
    /// be called from within a Tokio runtime. Failures are logged, never
    /// returned.
    pub fn walk(&self, path: impl Into<String>, value: Value, options: WalkOptions) -> WalkHandle {
        let tracker = TaskTracker::new();
        self.shared.spawn_walk(&tracker, path.into(), value, Arc::new(options));
        tracker.close();
        WalkHandle { tracker }
    }

    /// Walk and wait for the whole document to be materialized
    pub async fn walk_and_wait(&self, path: impl Into<String>, value: Value, options: WalkOptions) {
        self.walk(path, value, options).wait().await;
    }
}

impl<S: TreeStore + 'static> Shared<S> {
    pub(crate) fn spawn_walk(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        path: String,
        value: Value,
        options: Arc<WalkOptions>,
    ) {
        let shared = Arc::clone(self);
        let task_tracker = tracker.clone();
        tracker.spawn(async move {
            if let Err(err) = shared.walk(&task_tracker, &path, &value, &options).await {
                error!(path = %path, value = %value, "Error extracting keys: {:#}", err);
            }
        });
    }

    /// Walk one subtree. An error abandons the rest of this subtree only.
    async fn walk(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        path: &str,
        value: &Value,
        options: &Arc<WalkOptions>,
    ) -> Result<()> {
        if value.is_null() {
            debug!(path = %path, "Cannot extract empty value");
            return Ok(());
        }

        let path = path.strip_suffix('.').unwrap_or(path);

        let value = if options.decodes_base64(path, value) {
            Cow::Owned(detect::decode_base64(path, value.clone()))
        } else {
            Cow::Borrowed(value)
        };

        if is_scalar(&value) {
            let name = last_segment(path);
            let seed = options.label_seed(path, name);
            self.materialize_leaf(path, name, &value, seed, options.write).await;
            self.write_value(path, &value).await;
            return Ok(());
        }

        if options.remove_passwords && detect::is_sensitive(path) {
            debug!(path = %path, "Skipping password");
            return Ok(());
        }

        self.ensure_container(path, &value, options).await?;

        // One-shot options stop at this level
        let children = Arc::new(options.for_children());
        match &*value {
            Value::Array(items) => self.walk_array(tracker, items, "", path, &children),
            Value::Object(fields) => self.walk_fields(tracker, path, fields, &children).await,
            _ => {}
        }

        Ok(())
    }

    /// Create the container at `path` unless it is already known
    async fn ensure_container(&self, path: &str, value: &Value, options: &WalkOptions) -> Result<()> {
        if options.delete_before_update {
            debug!(path = %path, "Deleting before update");
            self.cache.purge_prefix(path);
            self.store
                .delete_subtree(path)
                .await
                .with_context(|| format!("Failed to delete {} before update", path))?;
        }

        if !self.cache.claim_container(path) {
            return Ok(());
        }

        // Keep metadata of containers that outlived the cache
        if !options.delete_before_update && self.store.node_exists(path).await {
            return Ok(());
        }

        let node = TreeNode::Container {
            name: container_name(value, options),
        };
        if let Err(err) = self.store.create_or_update_node(path, &node).await {
            error!(path = %path, error = %err, "Cannot create container");
            self.cache.invalidate(path);
        }

        Ok(())
    }

    async fn walk_fields(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        path: &str,
        fields: &Map<String, Value>,
        options: &Arc<WalkOptions>,
    ) {
        for (key, child) in fields {
            if options.remove_passwords && detect::is_sensitive(key) {
                debug!(path = %path, key = %key, "Skipping password");
                continue;
            }

            let child_path = format!("{}.{}", path, key);

            let mut child = match child {
                Value::Null => Value::String(String::new()),
                other => other.clone(),
            };

            if options.auto_cast {
                if let Some(parsed) = child.as_str().and_then(detect::parse_json_string) {
                    child = parsed;
                }
            }

            if options.decodes_base64(key, &child) {
                child = detect::decode_base64(&child_path, child);
            }

            match child {
                Value::Array(items) => self.walk_array(tracker, &items, key, path, options),
                Value::Object(nested) => {
                    self.spawn_walk(tracker, child_path, Value::Object(nested), Arc::clone(options));
                }
                scalar => self.write_field(path, key, scalar, options).await,
            }
        }
    }

    /// Materialize a scalar field of an object, plus its derived leaves
    async fn write_field(&self, path: &str, key: &str, value: Value, options: &WalkOptions) {
        let value = units::trim_decimals(key, value);
        let leaf_path = format!("{}.{}", path, key);
        let name = options.display_name(key);

        let seed = options.label_seed(&leaf_path, key);
        let issued = self.materialize_leaf(&leaf_path, name, &value, seed, options.write).await;
        self.write_value(&leaf_path, &value).await;

        if let Some(km) = units::distance_in_km(key, &value) {
            let km_path = units::companion_path(path, key);
            let km_value = units::number_value(km);
            // A re-typed or relabeled source re-issues its companion too
            if issued == Issued::Updated {
                self.cache.invalidate(&km_path);
            }
            self.materialize_leaf(&km_path, name, &km_value, None, options.write).await;
            self.write_value(&km_path, &km_value).await;
        }
    }

    /// Issue the leaf node if the cache says it is new, re-typed or has new labels.
    ///
    /// Returns once the node is in the store, whether this call issued it or
    /// a concurrent one did.
    pub(crate) async fn materialize_leaf(
        &self,
        path: &str,
        name: &str,
        value: &Value,
        seed: Option<&Labels>,
        writable: bool,
    ) -> Issued {
        let (state, previous, done) = match self.cache.observe_leaf(path, value, seed) {
            LeafDecision::Known(gate) => {
                gate.wait().await;
                return Issued::No;
            }
            LeafDecision::Issue { state, previous, done } => (state, previous, done),
        };
        previous.wait().await;

        let mut descriptor = NodeDescriptor::new(name, state.value_type, writable);
        if let Some(labels) = state.labels {
            descriptor = descriptor.with_labels(labels);
        }

        let issued = match self.store.create_or_update_node(path, &TreeNode::Leaf(descriptor)).await {
            Ok(()) if state.first_sight => {
                debug!(path = %path, value_type = %state.value_type, "Created state");
                Issued::Created
            }
            Ok(()) => {
                debug!(path = %path, value_type = %state.value_type, "Updated state");
                Issued::Updated
            }
            Err(err) => {
                error!(path = %path, error = %err, "Cannot create state");
                self.cache.invalidate(path);
                Issued::No
            }
        };
        done.settle();
        issued
    }

    pub(crate) async fn write_value(&self, path: &str, value: &Value) {
        if let Err(err) = self.store.write_value(path, value, true).await {
            error!(path = %path, error = %err, "Cannot write value");
        }
    }
}

/// What `materialize_leaf` did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Issued {
    No,
    Created,
    Updated,
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn last_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

fn container_name(value: &Value, options: &WalkOptions) -> String {
    let described = options
        .prefered_array_desc
        .as_deref()
        .and_then(|field| value.get(field))
        .and_then(|field| match field {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    described
        .or_else(|| options.channel_name.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::melt::store::MemoryStore;
    use crate::melt::types::{Role, ValueType};
    use async_trait::async_trait;
    use serde_json::json;

    /// Yields inside node creation so that concurrent walks interleave
    #[derive(Default)]
    struct YieldingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl TreeStore for YieldingStore {
        async fn create_or_update_node(&self, path: &str, node: &TreeNode) -> Result<(), StoreError> {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            self.inner.create_or_update_node(path, node).await
        }

        async fn delete_subtree(&self, path: &str) -> Result<(), StoreError> {
            self.inner.delete_subtree(path).await
        }

        async fn write_value(&self, path: &str, value: &Value, internal: bool) -> Result<(), StoreError> {
            self.inner.write_value(path, value, internal).await
        }

        async fn node_exists(&self, path: &str) -> bool {
            self.inner.node_exists(path).await
        }
    }

    fn melter() -> Melter<MemoryStore> {
        Melter::new(Arc::new(MemoryStore::new()))
    }

    fn leaf_type(melter: &Melter<MemoryStore>, path: &str) -> ValueType {
        melter.store().node(path).unwrap().as_leaf().unwrap().value_type
    }

    #[tokio::test]
    async fn test_nested_object() {
        let melter = melter();
        let data = json!({
            "display_name": "Red",
            "charge_state": {"battery_level": 80, "charging": false}
        });

        melter.walk_and_wait("car", data, WalkOptions::default()).await;

        let store = melter.store();
        assert_eq!(store.value("car.display_name"), Some(json!("Red")));
        assert_eq!(store.value("car.charge_state.battery_level"), Some(json!(80)));
        assert_eq!(store.value("car.charge_state.charging"), Some(json!(false)));
        assert!(matches!(store.node("car.charge_state"), Some(TreeNode::Container { .. })));
        assert_eq!(leaf_type(&melter, "car.charge_state.charging"), ValueType::Boolean);
        assert!(store.stored_value("car.display_name").unwrap().internal);
    }

    #[tokio::test]
    async fn test_scalar_root() {
        let melter = melter();
        melter.walk_and_wait("car.name.", json!("Red"), WalkOptions::default()).await;

        let node = melter.store().node("car.name").unwrap();
        assert_eq!(node.name(), "name");
        assert_eq!(melter.store().value("car.name"), Some(json!("Red")));
    }

    #[tokio::test]
    async fn test_null_root_touches_nothing() {
        let melter = melter();
        melter.walk_and_wait("car", Value::Null, WalkOptions::default()).await;
        assert_eq!(melter.store().node_count(), 0);
        assert!(melter.cache().is_empty());
    }

    #[tokio::test]
    async fn test_null_field_becomes_empty_string() {
        let melter = melter();
        melter.walk_and_wait("car", json!({"nickname": null}), WalkOptions::default()).await;
        assert_eq!(melter.store().value("car.nickname"), Some(json!("")));
    }

    #[tokio::test]
    async fn test_walk_is_idempotent() {
        let melter = melter();
        let data = json!({
            "odometer": 100,
            "state": {"locked": true, "doors": [{"name": "front", "open": false}]},
            "options": [{"key": "soc", "value": 42}]
        });

        melter.walk_and_wait("car", data.clone(), WalkOptions::default()).await;
        let creates = melter.store().create_calls();
        let writes = melter.store().write_calls();
        let cache = melter.cache().entries();
        let snapshot = melter.store().snapshot();

        melter.walk_and_wait("car", data, WalkOptions::default()).await;
        assert_eq!(melter.store().create_calls(), creates);
        assert_eq!(melter.store().write_calls(), writes * 2);
        assert_eq!(melter.cache().entries(), cache);
        assert_eq!(melter.store().snapshot(), snapshot);
    }

    #[tokio::test]
    async fn test_type_widening_never_reverts() {
        let melter = melter();
        let options = WalkOptions::default();

        melter.walk_and_wait("car", json!({"shift_state": 1}), options.clone()).await;
        assert_eq!(leaf_type(&melter, "car.shift_state"), ValueType::Number);

        melter.walk_and_wait("car", json!({"shift_state": "D"}), options.clone()).await;
        assert_eq!(leaf_type(&melter, "car.shift_state"), ValueType::Mixed);

        melter.walk_and_wait("car", json!({"shift_state": 3}), options).await;
        assert_eq!(leaf_type(&melter, "car.shift_state"), ValueType::Mixed);
        assert_eq!(
            melter.cache().get("car.shift_state").unwrap().value_type,
            Some(ValueType::Mixed)
        );
        assert_eq!(melter.store().value("car.shift_state"), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_odometer_companion() {
        let melter = melter();
        melter.walk_and_wait("car", json!({"odometer": 100, "battery_level": 80}), WalkOptions::default()).await;

        let store = melter.store();
        assert_eq!(store.value("car.odometer"), Some(json!(100)));
        assert_eq!(store.value("car.odometer_km"), Some(json!(160.93)));
        assert_eq!(leaf_type(&melter, "car.odometer_km"), ValueType::Number);
        assert!(store.node("car.battery_level_km").is_none());
    }

    #[tokio::test]
    async fn test_companion_uses_description() {
        let melter = melter();
        let mut options = WalkOptions::default();
        options.descriptions.insert("est_battery_range".into(), "Estimated range".into());

        melter.walk_and_wait("car", json!({"est_battery_range": 50}), options).await;

        let store = melter.store();
        assert_eq!(store.node("car.est_battery_range").unwrap().name(), "Estimated range");
        assert_eq!(store.node("car.est_battery_range_km").unwrap().name(), "Estimated range");
        assert_eq!(store.value("car.est_battery_range_km"), Some(json!(80.47)));
    }

    #[tokio::test]
    async fn test_decimal_trim() {
        let melter = melter();
        melter.walk_and_wait("site", json!({"battery_power": 1.23456, "grid_energy_imported": 10.019}), WalkOptions::default()).await;
        assert_eq!(melter.store().value("site.battery_power"), Some(json!(1.23)));
        assert_eq!(melter.store().value("site.grid_energy_imported"), Some(json!(10.02)));
    }

    #[tokio::test]
    async fn test_password_skips_only_the_offending_key() {
        let melter = melter();
        let options = WalkOptions::default().with_remove_passwords(true);

        melter.walk_and_wait("account", json!({"password": "x", "other": 1}), options).await;

        let store = melter.store();
        assert!(store.node("account.password").is_none());
        assert_eq!(store.value("account.other"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_password_container_is_skipped() {
        let melter = melter();
        let options = WalkOptions::default().with_remove_passwords(true);

        melter.walk_and_wait("account.passwordPolicy", json!({"length": 12}), options).await;
        assert_eq!(melter.store().node_count(), 0);
    }

    #[tokio::test]
    async fn test_passwords_kept_without_filter() {
        let melter = melter();
        melter.walk_and_wait("account", json!({"password": "x"}), WalkOptions::default()).await;
        assert_eq!(melter.store().value("account.password"), Some(json!("x")));
    }

    #[tokio::test]
    async fn test_base64_root_value() {
        let melter = melter();
        let options = WalkOptions::default().with_parse_base64(true);

        melter.walk_and_wait("car.blob", json!("eyJhIjoxfQ=="), options).await;
        assert_eq!(melter.store().value("car.blob.a"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_base64_by_key() {
        let melter = melter();
        let mut options = WalkOptions::default();
        options.parse_base64_by_ids.push("config".into());

        melter.walk_and_wait("car", json!({"config": "eyJhIjoxfQ==", "plain": "aGVsbG8="}), options).await;

        let store = melter.store();
        assert_eq!(store.value("car.config.a"), Some(json!(1)));
        // Not listed and global decoding is off
        assert_eq!(store.value("car.plain"), Some(json!("aGVsbG8=")));
    }

    #[tokio::test]
    async fn test_auto_cast() {
        let melter = melter();
        let options = WalkOptions::default().with_auto_cast(true);

        melter.walk_and_wait("car", json!({"settings": "{\"x\": 1}", "count": "7"}), options).await;

        assert_eq!(melter.store().value("car.settings.x"), Some(json!(1)));
        assert_eq!(melter.store().value("car.count"), Some(json!(7)));
    }

    #[tokio::test]
    async fn test_write_option_sets_roles() {
        let melter = melter();
        let options = WalkOptions::default().with_write(true);

        melter.walk_and_wait("car", json!({"locked": true, "temp": 21}), options).await;

        let locked = melter.store().node("car.locked").unwrap();
        let locked = locked.as_leaf().unwrap();
        assert!(locked.writable);
        assert_eq!(locked.role, Role::Switch);
        let temp = melter.store().node("car.temp").unwrap();
        assert_eq!(temp.as_leaf().unwrap().role, Role::Level);
    }

    #[tokio::test]
    async fn test_channel_name_applies_to_root_only() {
        let melter = melter();
        let options = WalkOptions::default().with_channel_name("Vehicle");

        melter.walk_and_wait("car", json!({"state": {"a": 1}}), options).await;

        assert_eq!(melter.store().node("car").unwrap().name(), "Vehicle");
        assert_eq!(melter.store().node("car.state").unwrap().name(), "");
    }

    #[tokio::test]
    async fn test_existing_container_keeps_metadata() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_or_update_node("car", &TreeNode::Container { name: "My car".into() })
            .await
            .unwrap();

        let melter = Melter::new(Arc::clone(&store));
        melter.walk_and_wait("car", json!({"a": 1}), WalkOptions::default().with_channel_name("Other")).await;

        assert_eq!(store.node("car").unwrap().name(), "My car");
        assert_eq!(store.value("car.a"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_delete_before_update() {
        let melter = melter();
        melter.walk_and_wait("car", json!({"old": {"x": 1}}), WalkOptions::default()).await;
        assert!(melter.store().node("car.old.x").is_some());

        let options = WalkOptions::default().with_delete_before_update(true);
        melter.walk_and_wait("car", json!({"new": {"y": 2}}), options).await;

        let store = melter.store();
        assert!(store.node("car.old").is_none());
        assert!(store.node("car.old.x").is_none());
        assert!(melter.cache().get("car.old.x").is_none());
        assert_eq!(store.value("car.new.y"), Some(json!(2)));
        assert!(store.node("car").is_some());
    }

    #[tokio::test]
    async fn test_labels_from_states() {
        let melter = melter();
        let mut options = WalkOptions::default();
        options
            .states
            .insert("charging".into(), Labels::from([("0".to_string(), "Stopped".to_string())]));

        melter.walk_and_wait("car", json!({"charging": 1}), options.clone()).await;
        melter.walk_and_wait("car", json!({"charging": 2}), options).await;

        let node = melter.store().node("car.charging").unwrap();
        let labels = node.as_leaf().unwrap().labels.clone().unwrap();
        assert_eq!(labels["0"], "Stopped");
        assert_eq!(labels["1"], "1");
        assert_eq!(labels["2"], "2");
    }

    #[tokio::test]
    async fn test_store_failure_is_contained() {
        let melter = Melter::new(Arc::new(MemoryStore::rejecting("car.bad")));
        melter.walk_and_wait("car", json!({"bad": 1, "good": 2}), WalkOptions::default()).await;

        let store = melter.store();
        assert!(store.node("car.bad").is_none());
        assert_eq!(store.value("car.good"), Some(json!(2)));
        // Not recorded as created, so the next ingest retries
        assert!(!melter.cache().get("car.bad").unwrap().created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_walks_create_once() {
        let store = Arc::new(YieldingStore::default());
        let melter = Melter::new(Arc::clone(&store));
        let handles: Vec<WalkHandle> = (0..8)
            .map(|i| melter.walk("car", json!({"speed": i, "state": {"locked": true}}), WalkOptions::default()))
            .collect();
        for handle in handles {
            handle.wait().await;
        }

        // car, car.speed, car.speed_km, car.state, car.state.locked
        assert_eq!(store.inner.node_count(), 5);
        assert_eq!(store.inner.create_calls(), 5);
        // speed, speed_km and locked for every walk
        assert_eq!(store.inner.write_calls(), 24);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_sight_keeps_every_write() {
        let store = Arc::new(YieldingStore::default());
        let melter = Melter::new(Arc::clone(&store));

        let first = melter.walk("car", json!({"speed": 1}), WalkOptions::default());
        let second = melter.walk("car", json!({"speed": 2}), WalkOptions::default());
        first.wait().await;
        second.wait().await;

        assert_eq!(store.inner.create_calls(), 3);
        assert_eq!(store.inner.write_calls(), 4);
        let speed = store.inner.value("car.speed").unwrap();
        assert!(speed == json!(1) || speed == json!(2));
        assert!(store.inner.value("car.speed_km").is_some());
    }

    #[tokio::test]
    async fn test_retyped_distance_reissues_companion() {
        let melter = melter();
        melter.walk_and_wait("car", json!({"speed": 10}), WalkOptions::default()).await;
        // car, car.speed, car.speed_km
        assert_eq!(melter.store().create_calls(), 3);

        melter.walk_and_wait("car", json!({"speed": "20"}), WalkOptions::default()).await;
        assert_eq!(melter.store().create_calls(), 5);
        assert_eq!(leaf_type(&melter, "car.speed"), ValueType::Mixed);
        assert_eq!(leaf_type(&melter, "car.speed_km"), ValueType::Number);
        assert_eq!(melter.store().value("car.speed_km"), Some(json!(32.19)));

        // Same type again: values only
        melter.walk_and_wait("car", json!({"speed": "30"}), WalkOptions::default()).await;
        assert_eq!(melter.store().create_calls(), 5);
        assert_eq!(melter.store().value("car.speed_km"), Some(json!(48.28)));
    }

    #[tokio::test]
    async fn test_non_distance_keys_get_no_companion_on_retype() {
        let melter = melter();
        melter.walk_and_wait("car", json!({"battery_level": 80}), WalkOptions::default()).await;
        melter.walk_and_wait("car", json!({"battery_level": "full"}), WalkOptions::default()).await;

        assert_eq!(leaf_type(&melter, "car.battery_level"), ValueType::Mixed);
        assert!(melter.store().node("car.battery_level_km").is_none());
    }
}
