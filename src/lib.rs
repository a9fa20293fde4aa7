//! # Live Store
//!
//! An in-memory, path-addressed object store that keeps many consumers in
//! sync with live data and forgets stale entries on its own.
//!
//! ## Core Concepts
//!
//! - **Paths**: dotted addresses into a JSON tree, with `$keys`, `$type`,
//!   `$size` and `$meta` views
//! - **Metadata**: every written path carries an expiry and a write time
//! - **Subscriptions**: debounced listeners, including recursive ones
//! - **Expiry**: a single adaptive timer drives a consistency sweep
//!
//! ## Example
//!
//! ```ignore
//! use livestore::{MetaPatch, Store, StoreConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let store = Store::new(StoreConfig::default());
//!
//! // Listen for changes
//! let id = store.subscribe("users.alice", |value| println!("alice: {:?}", value));
//!
//! // Write, with a custom lifetime
//! store.set_with_meta(
//!     "users.alice",
//!     json!({"online": true}),
//!     MetaPatch::expire_in(Duration::from_secs(60)),
//! );
//!
//! // Persist
//! store.backup_to_file("./store.ndjson").await?;
//! store.unsubscribe("users.alice", id);
//! ```

pub mod backup;
pub mod error;
pub mod expiry;
pub mod path;
pub mod store;
pub mod subscriptions;
pub mod tree;
pub mod types;

// Re-exports
pub use backup::{read_records, write_records, BackupRecord, LineDecoder};
pub use error::{Result, StoreError};
pub use expiry::{ExpirationScheduler, SchedulerConfig};
pub use path::{PathList, Selector};
pub use store::{DebugEvent, DebugSink, Snapshot, Store, StoreConfig};
pub use subscriptions::{
    DropReason, FlushDelay, ListenerId, Payload, SubscriptionHandle, SubscriptionRegistry,
    ValueEvent,
};
pub use tree::{leaf_paths, tree_del, tree_del_many, tree_get, tree_lookup, tree_set};
pub use types::*;
