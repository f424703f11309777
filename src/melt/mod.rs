//! JSON melting - materialize nested JSON into a hierarchical state tree
//!
//! This module walks arbitrary, schema-less JSON documents and turns them
//! into addressable nodes of a tree store: containers for objects and
//! arrays, leaves for scalars. Node identity, naming and typing are decided
//! deterministically from the payload itself, so walking the same document
//! twice creates nothing new.
//!
//! ## Concurrency
//!
//! `Melter::walk` fans out over nested objects and array elements and
//! returns a `WalkHandle` right away. Await `WalkHandle::wait` when later
//! work depends on the nodes being in place.

pub mod types;
pub mod cache;
pub mod detect;
pub mod units;
pub mod array;
pub mod walker;
pub mod store;
pub mod writer;

pub use types::{Labels, NodeDescriptor, Role, TreeNode, ValueType, WalkOptions};
pub use cache::{CacheEntry, IssueGate, IssueSignal, LeafDecision, LeafState, TypeCache};
pub use array::{collapse_pair, resolve_segment, CollapsedPair};
pub use walker::{Melter, WalkHandle};
pub use store::{MemoryStore, StoredValue, TreeEntry, TreeStore};
pub use writer::TreeWriter;
