//! The tree store seam and an in-memory implementation

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::StoreError;
use crate::melt::types::TreeNode;

/// Persistence behind the walker.
///
/// Implementations must make node creation idempotent: issuing the same
/// node twice is not an error.
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Create a node, or update the metadata of an existing one
    async fn create_or_update_node(&self, path: &str, node: &TreeNode) -> Result<(), StoreError>;

    /// Delete a node and everything below it
    async fn delete_subtree(&self, path: &str) -> Result<(), StoreError>;

    /// Set the current value. `internal` marks system-originated writes.
    async fn write_value(&self, path: &str, value: &Value, internal: bool) -> Result<(), StoreError>;

    async fn node_exists(&self, path: &str) -> bool;
}

/// A value as last written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredValue {
    pub value: Value,
    pub internal: bool,
}

/// One path of a store snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<TreeNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Concurrent in-memory tree store
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: DashMap<String, TreeNode>,
    values: DashMap<String, StoredValue>,
    create_calls: AtomicUsize,
    write_calls: AtomicUsize,
    /// Paths under this prefix are rejected
    reject_prefix: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects creations and writes at or below `prefix`
    pub fn rejecting(prefix: impl Into<String>) -> Self {
        MemoryStore {
            reject_prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn node(&self, path: &str) -> Option<TreeNode> {
        self.nodes.get(path).map(|r| r.value().clone())
    }

    pub fn value(&self, path: &str) -> Option<Value> {
        self.values.get(path).map(|r| r.value.clone())
    }

    pub fn stored_value(&self, path: &str) -> Option<StoredValue> {
        self.values.get(path).map(|r| r.value().clone())
    }

    /// Paths of all nodes, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.nodes.iter().map(|r| r.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::Relaxed)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::Relaxed)
    }

    /// Nodes and values merged by path, sorted by path
    pub fn snapshot(&self) -> Vec<TreeEntry> {
        let mut merged: BTreeMap<String, TreeEntry> = BTreeMap::new();
        for r in self.nodes.iter() {
            merged
                .entry(r.key().clone())
                .or_insert_with(|| empty_entry(r.key()))
                .node = Some(r.value().clone());
        }
        for r in self.values.iter() {
            merged
                .entry(r.key().clone())
                .or_insert_with(|| empty_entry(r.key()))
                .value = Some(r.value().value.clone());
        }
        merged.into_values().collect()
    }

    fn check(&self, path: &str) -> Result<(), StoreError> {
        match &self.reject_prefix {
            Some(prefix) if in_subtree(path, prefix) => Err(StoreError::Rejected {
                path: path.to_string(),
                reason: "rejected by configuration".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TreeStore for MemoryStore {
    async fn create_or_update_node(&self, path: &str, node: &TreeNode) -> Result<(), StoreError> {
        self.check(path)?;
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        self.nodes.insert(path.to_string(), node.clone());
        Ok(())
    }

    async fn delete_subtree(&self, path: &str) -> Result<(), StoreError> {
        self.nodes.retain(|key, _| !in_subtree(key, path));
        self.values.retain(|key, _| !in_subtree(key, path));
        Ok(())
    }

    async fn write_value(&self, path: &str, value: &Value, internal: bool) -> Result<(), StoreError> {
        self.check(path)?;
        if !self.nodes.contains_key(path) {
            return Err(StoreError::NotFound { path: path.to_string() });
        }
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.values.insert(
            path.to_string(),
            StoredValue {
                value: value.clone(),
                internal,
            },
        );
        Ok(())
    }

    async fn node_exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }
}

fn in_subtree(path: &str, root: &str) -> bool {
    path == root || (path.starts_with(root) && path[root.len()..].starts_with('.'))
}

fn empty_entry(path: &str) -> TreeEntry {
    TreeEntry {
        path: path.to_string(),
        node: None,
        value: None,
    }
}
