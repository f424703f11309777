//! Naming of array elements
//!
//! Each element of an array gets a path segment. The segment comes from the
//! element's own fields when they look like an identity (`*Id`, `*Name`,
//! `id`, `name`, ...), from `prefered_array_name`, or falls back to the
//! array key plus a 1-based, zero-padded index. Elements with exactly two
//! scalar fields (or two-element scalar tuples) are collapsed into a single
//! key/value leaf.

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::melt::detect;
use crate::melt::store::TreeStore;
use crate::melt::types::WalkOptions;
use crate::melt::walker::Shared;

/// Fields that name an element, lowest priority first
const NAMING_FIELDS: &[&str] = &["id", "name", "label", "labelText", "start_date_time"];

/// A two-field element flattened into one leaf
#[derive(Debug, Clone, PartialEq)]
pub struct CollapsedPair {
    /// The first field's value as text
    pub raw_key: String,
    /// Path below the array's parent: `key.raw_key`, or `raw_key` at a root array
    pub sub_key: String,
    /// "<first field name> <second field name>"
    pub name: String,
    pub value: Value,
}

pub fn index_segment(key: &str, index: usize) -> String {
    format!("{}{:02}", key, index + 1)
}

/// Resolve the path segment for the element at `index` of the array under `key`
pub fn resolve_segment(element: &Value, key: &str, index: usize, options: &WalkOptions) -> String {
    let fallback = index_segment(key, index);
    if options.force_index {
        return fallback;
    }
    let Value::Object(fields) = element else {
        return fallback;
    };

    let mut segment: Option<String> = None;

    if let Some((_, Value::String(first))) = fields.iter().next() {
        segment = non_empty(strip_dots(first)).or(segment);
    }

    // No short-circuit: the last matching field wins
    for (name, value) in fields {
        if name.ends_with("Id") {
            segment = scalar_text(value).or(segment);
        }
    }
    for (name, value) in fields {
        if name.ends_with("Name") {
            segment = scalar_text(value).or(segment);
        }
    }

    for field in NAMING_FIELDS {
        if let Some(value) = fields.get(*field) {
            segment = truthy_text(value).or(segment);
        }
    }

    if let Some(expr) = options.prefered_array_name.as_deref() {
        segment = prefered_segment(fields, expr).or(segment);
    }

    segment.unwrap_or(fallback)
}

/// Detect a `{"key": "soc", "value": 42}` or `["soc", 42]` shaped element
pub fn collapse_pair(element: &Value, key: &str, options: &WalkOptions) -> Option<CollapsedPair> {
    if options.force_index {
        return None;
    }
    // Tuple positions act as the field names
    let ((first_name, first_value), (second_name, second_value)) = match element {
        Value::Object(fields) if fields.len() == 2 => {
            let mut iter = fields.iter();
            let (first_name, first_value) = iter.next()?;
            let (second_name, second_value) = iter.next()?;
            ((first_name.as_str(), first_value), (second_name.as_str(), second_value))
        }
        Value::Array(items) if items.len() == 2 => (("0", &items[0]), ("1", &items[1])),
        _ => return None,
    };
    if !is_scalar(first_value) || !is_scalar(second_value) {
        return None;
    }

    let raw_key = plain_text(first_value)?;
    if raw_key == "null" {
        return None;
    }
    let sub_key = if key.is_empty() {
        raw_key.clone()
    } else {
        format!("{}.{}", key, raw_key)
    };

    Some(CollapsedPair {
        raw_key,
        sub_key,
        name: format!("{} {}", first_name, second_name),
        value: second_value.clone(),
    })
}

impl<S: TreeStore + 'static> Shared<S> {
    /// Walk the elements of an array found under `key` of the object at `path`
    pub(crate) fn walk_array(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        items: &[Value],
        key: &str,
        path: &str,
        options: &Arc<WalkOptions>,
    ) {
        for (index, element) in items.iter().enumerate() {
            if element.is_null() {
                debug!(path = %path, key = %key, index, "Cannot extract empty array element");
                continue;
            }

            if let Value::String(tag) = element {
                if !key.is_empty() {
                    let tag_path = format!("{}.{}.{}", path, key, tag);
                    self.spawn_walk(tracker, tag_path, element.clone(), Arc::clone(options));
                    continue;
                }
            }

            if let Some(pair) = collapse_pair(element, key, options) {
                self.spawn_pair(tracker, path.to_string(), pair, Arc::clone(options));
                continue;
            }

            let segment = resolve_segment(element, key, index, options);
            let element_path = format!("{}.{}", path, segment);
            self.spawn_walk(tracker, element_path, element.clone(), Arc::clone(options));
        }
    }

    fn spawn_pair(self: &Arc<Self>, tracker: &TaskTracker, path: String, pair: CollapsedPair, options: Arc<WalkOptions>) {
        let shared = Arc::clone(self);
        let task_tracker = tracker.clone();
        tracker.spawn(async move {
            shared.write_pair(&task_tracker, &path, pair, options).await;
        });
    }

    async fn write_pair(self: &Arc<Self>, tracker: &TaskTracker, path: &str, pair: CollapsedPair, options: Arc<WalkOptions>) {
        let leaf_path = format!("{}.{}", path, pair.sub_key);
        if options.remove_passwords && detect::is_sensitive(&leaf_path) {
            debug!(path = %leaf_path, "Skipping password");
            return;
        }

        let value = if options.decodes_base64(&pair.raw_key, &pair.value) {
            detect::decode_base64(&leaf_path, pair.value)
        } else {
            pair.value
        };

        // A decoded payload may carry a whole structure
        if value.is_object() || value.is_array() {
            self.spawn_walk(tracker, leaf_path, value, options);
            return;
        }

        let seed = options.label_seed(&leaf_path, &pair.sub_key);
        self.materialize_leaf(&leaf_path, &pair.name, &value, seed, options.write).await;
        self.write_value(&leaf_path, &value).await;
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn strip_dots(s: &str) -> String {
    s.replace('.', "")
}

fn compact(s: &str) -> String {
    s.replace(|c: char| c == '.' || c == ' ', "")
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Text of a scalar, unmodified
fn plain_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Any non-null scalar, dots stripped
fn scalar_text(value: &Value) -> Option<String> {
    plain_text(value).map(|s| strip_dots(&s)).and_then(non_empty)
}

/// Scalars that are not `false`, `0` or empty, dots stripped
fn truthy_text(value: &Value) -> Option<String> {
    match value {
        Value::Bool(false) => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        other => scalar_text(other),
    }
}

/// Segment from a `prefered_array_name` expression: `a+b`, `a+b/c`, `a/b` or `a`
fn prefered_segment(fields: &Map<String, Value>, expr: &str) -> Option<String> {
    if let Some((left, right)) = expr.split_once('+') {
        let left = fields.get(left).and_then(plain_text)?;
        let right = match right.split_once('/') {
            Some((outer, inner)) => fields
                .get(outer)
                .and_then(|nested| nested.get(inner))
                .or_else(|| fields.get(inner)),
            None => fields.get(right),
        }
        .and_then(plain_text)?;
        return Some(format!("{}-{}", compact(&left), compact(&right)));
    }

    if let Some((outer, inner)) = expr.split_once('/') {
        let nested = fields.get(outer)?.get(inner)?;
        return plain_text(nested).map(|s| compact(&s)).and_then(non_empty);
    }

    fields.get(expr).and_then(truthy_text)
}
