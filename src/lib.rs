//! # Ingot - JSON to State Tree
//!
//! A library that melts deeply nested, schema-less JSON documents (as
//! returned by device and cloud APIs) into a flat, addressable tree of
//! containers and typed leaves, updating values on every ingest.
//!
//! ## Modules
//!
//! - **melt**: walk JSON into a tree store, naming array elements and
//!   reconciling type drift
//! - **error**: errors reported by tree stores
//!
//! ## Quick Start
//!
//! ```rust
//! use ingot::melt::{Melter, MemoryStore, WalkOptions};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//! let melter = Melter::new(Arc::clone(&store));
//!
//! let data = json!({
//!     "vin": "5YJ3E1EA",
//!     "vehicle_state": {"odometer": 100, "locked": true},
//!     "doors": [{"name": "front", "open": false, "locked": true}]
//! });
//!
//! melter.walk_and_wait("car", data, WalkOptions::default()).await;
//!
//! assert_eq!(store.value("car.vehicle_state.odometer_km"), Some(json!(160.93)));
//! assert_eq!(store.value("car.front.open"), Some(json!(false)));
//! # }
//! ```

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::Read;

pub mod error;
pub mod melt;

// Re-export commonly used types for convenience
pub use error::StoreError;
pub use melt::{Melter, MemoryStore, TreeNode, TreeStore, TreeWriter, WalkHandle, WalkOptions};

/// Main entry point: melt every JSON document of a stream under `root`.
///
/// Accepts a single document or whitespace-separated documents (NDJSON).
/// Each document is fully materialized before the next one is read.
/// Returns the number of documents walked.
pub async fn melt_json<R: Read, S: TreeStore + 'static>(
    reader: R,
    root: &str,
    options: &WalkOptions,
    melter: &Melter<S>,
) -> Result<usize> {
    let stream = serde_json::Deserializer::from_reader(reader).into_iter::<Value>();
    let mut count = 0;

    for value in stream {
        let value = value.context("Failed to parse JSON")?;
        melter.walk_and_wait(root, value, options.clone()).await;
        count += 1;
    }

    Ok(count)
}
