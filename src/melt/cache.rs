//! Materialization cache: which paths exist in the tree and their last type
//!
//! Every decision that is check-then-act ("is this path new, has its type
//! changed, is this label new") runs inside a single `DashMap` entry guard,
//! which makes it a per-path critical section. Guards are never held across
//! calls into the tree store.
//!
//! A node being issued is tracked by an [`IssueGate`]. Observers that find
//! the path already decided wait on the gate, so no value is written before
//! its node has reached the store.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::melt::types::{Labels, ValueType};

/// What the cache knows about one path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    pub created: bool,
    /// `None` for containers
    pub value_type: Option<ValueType>,
    pub labels: Option<Labels>,
}

impl CacheEntry {
    /// Combine the stored type with an observation. `Mixed` is sticky.
    fn widen(&mut self, path: &str, observed: ValueType) -> ValueType {
        match self.value_type {
            Some(stored) if stored != observed => {
                if stored != ValueType::Mixed {
                    debug!(path = %path, from = %stored, to = %observed, "Type changed, widening to mixed");
                }
                self.value_type = Some(ValueType::Mixed);
                ValueType::Mixed
            }
            Some(stored) => stored,
            None => observed,
        }
    }

    /// Add seed labels and the raw value as its own label. Returns true if anything was added.
    fn merge_labels(&mut self, seed: Option<&Labels>, raw: &Value) -> bool {
        if seed.is_none() && self.labels.is_none() {
            return false;
        }
        let labels = self.labels.get_or_insert_with(Labels::new);
        let mut added = false;
        for (raw_value, label) in seed.into_iter().flatten() {
            if !labels.contains_key(raw_value) {
                labels.insert(raw_value.clone(), label.clone());
                added = true;
            }
        }
        let key = label_key(raw);
        if !labels.contains_key(&key) {
            labels.insert(key.clone(), key);
            added = true;
        }
        added
    }
}

/// Outcome of observing a leaf value that requires (re)issuing its node
#[derive(Debug, Clone, PartialEq)]
pub struct LeafState {
    pub value_type: ValueType,
    pub labels: Option<Labels>,
    pub first_sight: bool,
}

/// Settles once the node last issued for a path has reached the store
#[derive(Debug, Clone)]
pub struct IssueGate(watch::Receiver<bool>);

impl IssueGate {
    fn settled() -> Self {
        let (_, rx) = watch::channel(true);
        IssueGate(rx)
    }

    fn pending() -> (IssueSignal, Self) {
        let (tx, rx) = watch::channel(false);
        (IssueSignal(tx), IssueGate(rx))
    }

    /// Wait until the issue lands. Returns at once if nothing is in flight.
    pub async fn wait(mut self) {
        loop {
            let settled = *self.0.borrow_and_update();
            // Sender gone: the issuing task ended without settling
            if settled || self.0.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        *self.0.borrow()
    }
}

impl Default for IssueGate {
    fn default() -> Self {
        Self::settled()
    }
}

/// Held by the task issuing a node. Settling (or dropping) it releases waiters.
#[derive(Debug)]
pub struct IssueSignal(watch::Sender<bool>);

impl IssueSignal {
    pub fn settle(self) {
        self.0.send_replace(true);
    }
}

/// What the caller of [`TypeCache::observe_leaf`] must do
#[derive(Debug)]
pub enum LeafDecision {
    /// Nothing to issue. Write once the gate settles.
    Known(IssueGate),
    /// Issue the node once `previous` settles, then settle `done`
    Issue {
        state: LeafState,
        previous: IssueGate,
        done: IssueSignal,
    },
}

impl LeafDecision {
    pub fn state(&self) -> Option<&LeafState> {
        match self {
            LeafDecision::Known(_) => None,
            LeafDecision::Issue { state, .. } => Some(state),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    entry: CacheEntry,
    gate: IssueGate,
}

/// Process-scoped, concurrent record of materialized paths
#[derive(Debug, Default)]
pub struct TypeCache {
    entries: DashMap<String, Slot>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<CacheEntry> {
        self.entries.get(path).map(|slot| slot.entry.clone())
    }

    pub fn record_create(&self, path: &str, value_type: ValueType) {
        let mut slot = self.entries.entry(path.to_string()).or_default();
        let effective = slot.entry.widen(path, value_type);
        slot.entry.value_type = Some(effective);
        slot.entry.created = true;
    }

    /// Effective type for `observed` at `path`: the stored type, or `Mixed` on conflict
    pub fn widen(&self, path: &str, observed: ValueType) -> ValueType {
        match self.entries.get_mut(path) {
            Some(mut slot) => slot.entry.widen(path, observed),
            None => observed,
        }
    }

    /// Drop every entry whose path starts with `prefix`
    pub fn purge_prefix(&self, prefix: &str) {
        self.entries.retain(|path, _| !path.starts_with(prefix));
    }

    /// Observe a leaf value and decide whether its node must be (re)issued.
    ///
    /// Returns [`LeafDecision::Known`] when the node is already decided with
    /// the effective type and every label. Otherwise the entry is recorded as
    /// created, a fresh gate replaces the previous one and the caller becomes
    /// responsible for issuing the node.
    pub fn observe_leaf(&self, path: &str, value: &Value, seed: Option<&Labels>) -> LeafDecision {
        let observed = ValueType::of(value);
        let mut slot = self.entries.entry(path.to_string()).or_default();
        let slot = &mut *slot;

        let first_sight = !slot.entry.created || slot.entry.value_type.is_none();
        let previous = slot.entry.value_type;
        let effective = slot.entry.widen(path, observed);
        let widened = previous.is_some_and(|stored| stored != effective);
        let labels_added = slot.entry.merge_labels(seed, value);

        if !(first_sight || widened || labels_added) {
            return LeafDecision::Known(slot.gate.clone());
        }

        slot.entry.created = true;
        slot.entry.value_type = Some(effective);

        let (done, gate) = IssueGate::pending();
        let previous = std::mem::replace(&mut slot.gate, gate);
        LeafDecision::Issue {
            state: LeafState {
                value_type: effective,
                labels: slot.entry.labels.clone(),
                first_sight,
            },
            previous,
            done,
        }
    }

    /// Claim a container path. Returns true if the caller must create it.
    pub fn claim_container(&self, path: &str) -> bool {
        let mut slot = self.entries.entry(path.to_string()).or_default();
        if slot.entry.created {
            return false;
        }
        slot.entry.created = true;
        true
    }

    /// Mark a path as not created after the store rejected it.
    /// The widened type and labels are kept.
    pub fn invalidate(&self, path: &str) {
        if let Some(mut slot) = self.entries.get_mut(path) {
            slot.entry.created = false;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, sorted by path
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        let mut entries: Vec<(String, CacheEntry)> = self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

fn label_key(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
