//! Path listeners for live store updates.
//!
//! This module knows nothing about the store. It provides:
//! - Listener lists keyed by path, with `$keys` change detection
//! - Debounced delivery with lazy (possibly async) payloads
//! - Recursive subtree ("deep") subscriptions
//! - Bounded channel subscriptions with slow-consumer dropping
//!
//! Current values are looked up through a resolver hook installed by the
//! owner of the data.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::default();
//! registry.set_resolver(|path| lookup(path));
//!
//! let id = registry.subscribe("users.alice, users.bob", |value| {
//!     println!("now: {:?}", value);
//! });
//!
//! registry.publish("users", true);
//! registry.unsubscribe("users.alice users.bob", id);
//! ```

mod debounce;
mod deep;
mod manager;
mod types;

pub use manager::{SubscriptionRegistry, DEFAULT_DEBOUNCE};
pub use types::{
    Cleanup, DeepCallback, DropReason, FlushDelay, ListenerId, Payload, ProducerFuture, Resolver,
    SubscriptionHandle, ValueCallback, ValueEvent,
};
