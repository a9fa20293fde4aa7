//! Recursive subtree subscriptions.
//!
//! A deep subscription mirrors the live shape of a subtree with internal
//! listeners: interior nodes watch `key$keys` and grow children as keys
//! appear, nodes at the target depth watch their value and forward it to
//! the user callback. The nodes form an explicit tree so the whole thing can
//! be torn down from the root.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::manager::{SubscriptionRegistry, WeakRegistry};
use super::types::{DeepCallback, ListenerId, ValueCallback};
use crate::path::{self, Selector, SELECTOR_MARK, SEPARATOR};

struct DeepNode {
    listener: ListenerId,
    /// Registered path (`key$keys` for interior nodes, `key` for leaves).
    watch: String,
    children: Vec<String>,
}

#[derive(Default)]
struct DeepNodes {
    torn_down: bool,
    nodes: HashMap<String, DeepNode>,
}

pub(crate) struct DeepSubscription {
    root: String,
    target_depth: usize,
    callback: DeepCallback,
    registry: WeakRegistry,
    nodes: Mutex<DeepNodes>,
}

impl DeepSubscription {
    fn watch_keys(self: &Arc<Self>, key: &str, parent: Option<&str>) {
        let weak = Arc::downgrade(self);
        let node_key = key.to_string();
        let callback: ValueCallback = Arc::new(move |value: Option<&Value>| {
            if let Some(subscription) = weak.upgrade() {
                subscription.on_keys(&node_key, value);
            }
        });
        self.attach(key, Selector::Keys.on(key), parent, callback);
    }

    fn watch_leaf(self: &Arc<Self>, key: &str, parent: &str) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let relative = path::relative(&self.root, key).to_string();
        let callback: ValueCallback = Arc::new(move |value: Option<&Value>| {
            if let Some(subscription) = weak.upgrade() {
                (subscription.callback)(&relative, value);
            }
        });
        self.attach(key, key.to_string(), Some(parent), callback);
    }

    /// Record a node and register its listener; no-op if the node exists.
    fn attach(&self, key: &str, watch: String, parent: Option<&str>, callback: ValueCallback) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let id = registry.next_id();
        {
            let mut state = self.nodes.lock();
            if state.torn_down || state.nodes.contains_key(key) {
                return;
            }
            state.nodes.insert(
                key.to_string(),
                DeepNode {
                    listener: id,
                    watch: watch.clone(),
                    children: Vec::new(),
                },
            );
            if let Some(node) = parent.and_then(|p| state.nodes.get_mut(p)) {
                node.children.push(key.to_string());
            }
        }
        registry.register(&watch, id, callback, None);
    }

    fn on_keys(self: &Arc<Self>, key: &str, value: Option<&Value>) {
        let Some(Value::Array(children)) = value else {
            return;
        };
        for child in children.iter().filter_map(Value::as_str) {
            if child.is_empty() || child.contains(SELECTOR_MARK) || child.contains(SEPARATOR) {
                continue;
            }
            let full = path::join(key, child);
            if path::depth(&full) >= self.target_depth {
                self.watch_leaf(&full, key);
            } else {
                self.watch_keys(&full, Some(key));
            }
        }
    }

    /// Unregister every internal listener, root first.
    fn teardown(&self) {
        let listeners: Vec<(String, ListenerId)> = {
            let mut state = self.nodes.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            let mut out = Vec::with_capacity(state.nodes.len());
            let mut stack = vec![self.root.clone()];
            while let Some(key) = stack.pop() {
                if let Some(node) = state.nodes.remove(&key) {
                    out.push((node.watch, node.listener));
                    stack.extend(node.children);
                }
            }
            out
        };
        debug!(root = %self.root, listeners = listeners.len(), "deep subscription torn down");
        if let Some(registry) = self.registry.upgrade() {
            for (watch, id) in listeners {
                registry.unsubscribe_exact(&watch, id);
            }
        }
    }
}

impl SubscriptionRegistry {
    /// Subscribe to every node `depth` levels below `path` (at least one).
    ///
    /// `callback` receives the node path relative to `path` and its value.
    /// The returned id lives under `path$deep`; unsubscribing it removes
    /// every internal listener. Returns `None` for paths with a selector.
    pub fn subscribe_deep<F>(&self, path: &str, depth: usize, callback: F) -> Option<ListenerId>
    where
        F: Fn(&str, Option<&Value>) + Send + Sync + 'static,
    {
        if path.contains(SELECTOR_MARK) {
            return None;
        }
        let id = self.next_id();
        let subscription = Arc::new(DeepSubscription {
            root: path.to_string(),
            target_depth: path::depth(path) + depth.max(1),
            callback: Arc::new(callback),
            registry: self.downgrade(),
            nodes: Mutex::new(DeepNodes::default()),
        });

        let owner = subscription.clone();
        self.register_marker(&Selector::Deep.on(path), id, Arc::new(move || owner.teardown()));
        subscription.watch_keys(path, None);
        Some(id)
    }

    /// Tear down a deep subscription created on `path`.
    pub fn unsubscribe_deep(&self, path: &str, id: ListenerId) {
        self.unsubscribe_exact(&Selector::Deep.on(path), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{tree_get, tree_set};
    use serde_json::{json, Map};
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<(String, Option<Value>)>>>;

    fn registry_over(tree: Arc<Mutex<Map<String, Value>>>) -> SubscriptionRegistry {
        let registry = SubscriptionRegistry::default();
        registry.set_resolver(move |p: &str| tree_get(&tree.lock(), p));
        registry
    }

    fn deep_recorder() -> (Seen, impl Fn(&str, Option<&Value>) + Send + Sync) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p: &str, v: Option<&Value>| sink.lock().push((p.to_string(), v.cloned())))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deep_delivers_existing_leaves() {
        let tree = Arc::new(Mutex::new(Map::new()));
        tree_set(&mut tree.lock(), "a.x.p", json!(1));
        tree_set(&mut tree.lock(), "a.y.q", json!(2));
        let registry = registry_over(tree.clone());

        let (seen, callback) = deep_recorder();
        let id = registry.subscribe_deep("a", 2, callback).unwrap();
        settle().await;

        let mut got = seen.lock().clone();
        got.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            got,
            vec![
                ("x.p".to_string(), Some(json!(1))),
                ("y.q".to_string(), Some(json!(2))),
            ]
        );

        registry.unsubscribe_deep("a", id);
        assert_eq!(registry.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deep_follows_new_keys() {
        let tree = Arc::new(Mutex::new(Map::new()));
        let registry = registry_over(tree.clone());
        let (seen, callback) = deep_recorder();
        registry.subscribe_deep("", 1, callback).unwrap();
        settle().await;
        assert!(seen.lock().is_empty());

        tree_set(&mut tree.lock(), "k", json!("v"));
        registry.publish("k", false);
        settle().await;

        assert!(seen
            .lock()
            .contains(&("k".to_string(), Some(json!("v")))));
    }

    #[test]
    fn test_deep_rejects_selectors() {
        let registry = SubscriptionRegistry::default();
        assert!(registry.subscribe_deep("a$keys", 1, |_, _| {}).is_none());
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_unsubscribe_all_tears_down() {
        let registry = SubscriptionRegistry::default();
        registry.subscribe_deep("a", 3, |_, _| {}).unwrap();
        assert_eq!(registry.listener_count(), 2);
        registry.unsubscribe_all();
        assert_eq!(registry.listener_count(), 0);
    }
}
