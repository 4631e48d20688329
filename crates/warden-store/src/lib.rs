//! warden-store: embedded bucketed key/value storage
//!
//! A thin byte-oriented store over SQLite. Keys and values are opaque
//! blobs grouped into named buckets; the rest of the agent never sees SQL.

pub mod error;
pub mod kvstore;

pub use error::{Result, StoreError};
pub use kvstore::{KvStore, CONTROLLERS_BUCKET, PLUGIN_INSTANCES_BUCKET};
