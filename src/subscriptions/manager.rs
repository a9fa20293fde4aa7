//! Listener registry keyed by path.

use crate::path::{self, PathList, Selector};
use crate::types::keys_of;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

use super::debounce::Debounces;
use super::types::{
    Cleanup, DropReason, FlushDelay, ListenerId, Payload, Resolver, SubscriptionHandle,
    ValueCallback, ValueEvent,
};

/// Default debounce window for notifications.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(10);

/// A registered listener.
#[derive(Clone)]
pub(crate) struct Listener {
    pub(crate) id: ListenerId,
    /// None for marker entries (`path$deep`) that only exist to own a cleanup.
    pub(crate) callback: Option<ValueCallback>,
    pub(crate) cleanup: Option<Cleanup>,
}

/// Listener lists plus the key-set memory used for `$keys` change detection.
#[derive(Default)]
struct Listeners {
    /// Path (selector included) -> listeners in registration order.
    by_path: HashMap<String, Vec<Listener>>,
    /// Registered paths in first-registration order.
    order: Vec<String>,
    /// Path -> sorted, comma-joined key set last notified.
    last_keys: HashMap<String, String>,
}

impl Listeners {
    fn callbacks(&self, path: &str) -> Vec<ValueCallback> {
        self.by_path
            .get(path)
            .map(|list| list.iter().filter_map(|l| l.callback.clone()).collect())
            .unwrap_or_default()
    }

    fn insert(&mut self, path: &str, listener: Listener) {
        match self.by_path.get_mut(path) {
            Some(list) => list.push(listener),
            None => {
                self.order.push(path.to_string());
                self.by_path.insert(path.to_string(), vec![listener]);
            }
        }
    }

    /// Remove matching listeners from `path`, dropping the entry once empty.
    fn remove<F>(&mut self, path: &str, matches: F) -> Vec<Listener>
    where
        F: Fn(&Listener) -> bool,
    {
        let Some(list) = self.by_path.get_mut(path) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|l| matches(l));
        *list = kept;
        if list.is_empty() {
            self.by_path.remove(path);
            self.order.retain(|p| p != path);
            if let (base, Some(_)) = path::split(path) {
                if !self.by_path.contains_key(&Selector::Keys.on(base)) {
                    self.last_keys.remove(base);
                }
            }
        }
        removed
    }

    fn take_all(&mut self) -> Vec<Listener> {
        self.order.clear();
        self.last_keys.clear();
        self.by_path.drain().flat_map(|(_, list)| list).collect()
    }
}

pub(crate) struct RegistryInner {
    /// Default debounce window.
    pub(crate) debounce: Duration,
    /// Counter for generating listener IDs.
    next_id: AtomicU64,
    listeners: Mutex<Listeners>,
    resolver: RwLock<Resolver>,
    pub(crate) debounces: Mutex<Debounces>,
}

/// Registry of path listeners.
///
/// Cheap to clone; clones share the same listeners. Callbacks always run
/// outside the registry's locks, so they may subscribe, unsubscribe or read
/// the store freely.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    pub(crate) inner: Arc<RegistryInner>,
}

/// Non-owning reference to a registry, held by callbacks and timers.
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<SubscriptionRegistry> {
        self.0.upgrade().map(|inner| SubscriptionRegistry { inner })
    }
}

impl SubscriptionRegistry {
    /// Create a registry with the given default debounce window.
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                debounce,
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Listeners::default()),
                resolver: RwLock::new(Arc::new(|_: &str| None)),
                debounces: Mutex::new(Debounces::default()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    pub(crate) fn next_id(&self) -> ListenerId {
        ListenerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Install the hook used to look up current values.
    pub fn set_resolver<F>(&self, resolver: F)
    where
        F: Fn(&str) -> Option<Value> + Send + Sync + 'static,
    {
        *self.inner.resolver.write() = Arc::new(resolver);
    }

    /// Current value of `path` according to the resolver.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let resolver = self.inner.resolver.read().clone();
        resolver(path)
    }

    // --- Registration ---

    /// Listen on one or more paths. The current value, if any, is delivered
    /// on the next scheduling tick.
    pub fn subscribe<P, F>(&self, paths: P, callback: F) -> ListenerId
    where
        P: Into<PathList>,
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let callback: ValueCallback = Arc::new(callback);
        for path in paths.into().iter() {
            self.register(path, id, callback.clone(), None);
        }
        id
    }

    /// Listen until the first delivery, initial catch-up included.
    pub fn subscribe_once<P, F>(&self, paths: P, callback: F) -> ListenerId
    where
        P: Into<PathList>,
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let paths: PathList = paths.into();
        let registered = paths.clone();
        let registry = self.downgrade();
        let fired = AtomicBool::new(false);
        let callback: ValueCallback = Arc::new(move |value: Option<&Value>| {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(registry) = registry.upgrade() {
                registry.unsubscribe(registered.clone(), id);
            }
            callback(value);
        });
        for path in paths.iter() {
            self.register(path, id, callback.clone(), None);
        }
        id
    }

    /// Channel-backed subscription on a single path.
    ///
    /// A consumer that lets `buffer` events pile up is dropped and gets a
    /// final [`DropReason::BufferOverflow`] event when there is room for it.
    pub fn subscribe_channel(&self, path: &str, buffer: usize) -> SubscriptionHandle {
        let (sender, receiver) = crossbeam_channel::bounded(buffer.max(1));
        let id = self.next_id();
        let overflowed = Arc::new(AtomicBool::new(false));

        let registry = self.downgrade();
        let key = path.to_string();
        let tx = sender.clone();
        let overflow_flag = overflowed.clone();
        let callback: ValueCallback = Arc::new(move |value: Option<&Value>| {
            let event = ValueEvent::Value {
                path: key.clone(),
                value: value.cloned(),
            };
            if tx.try_send(event).is_err() {
                overflow_flag.store(true, Ordering::SeqCst);
                if let Some(registry) = registry.upgrade() {
                    registry.unsubscribe(key.as_str(), id);
                }
            }
        });

        let cleanup: Cleanup = Arc::new(move || {
            let reason = if overflowed.load(Ordering::SeqCst) {
                DropReason::BufferOverflow
            } else {
                DropReason::Unsubscribed
            };
            let _ = sender.try_send(ValueEvent::Dropped { reason });
        });

        self.register(path, id, callback, Some(cleanup));

        SubscriptionHandle {
            id,
            path: path.to_string(),
            receiver,
        }
    }

    /// Register a single path without splitting it and schedule the
    /// catch-up delivery.
    pub(crate) fn register(
        &self,
        path: &str,
        id: ListenerId,
        callback: ValueCallback,
        cleanup: Option<Cleanup>,
    ) {
        self.inner.listeners.lock().insert(
            path,
            Listener {
                id,
                callback: Some(callback.clone()),
                cleanup,
            },
        );
        self.deliver_current(path, id, callback);
    }

    /// Register an entry that never receives values, only owns a cleanup.
    pub(crate) fn register_marker(&self, path: &str, id: ListenerId, cleanup: Cleanup) {
        self.inner.listeners.lock().insert(
            path,
            Listener {
                id,
                callback: None,
                cleanup: Some(cleanup),
            },
        );
    }

    fn deliver_current(&self, path: &str, id: ListenerId, callback: ValueCallback) {
        let Some(value) = self.resolve(path) else {
            return;
        };
        if let (base, Some(selector)) = path::split(path) {
            if Selector::parse(selector) == Some(Selector::Keys) {
                self.seed_keys(base, &value);
            }
        }
        let registry = self.downgrade();
        let key = path.to_string();
        let deliver = move || {
            let still_registered = registry
                .upgrade()
                .map_or(false, |registry| registry.is_registered(&key, id));
            if still_registered {
                callback(Some(&value));
            }
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { deliver() });
            }
            Err(_) => deliver(),
        }
    }

    /// Remember the key set a new `$keys` listener is caught up with, unless
    /// earlier listeners are already tracking one.
    fn seed_keys(&self, base: &str, keys: &Value) {
        let mut names: Vec<&str> = keys
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        self.inner
            .listeners
            .lock()
            .last_keys
            .entry(base.to_string())
            .or_insert_with(|| names.join(","));
    }

    fn is_registered(&self, path: &str, id: ListenerId) -> bool {
        self.inner
            .listeners
            .lock()
            .by_path
            .get(path)
            .map_or(false, |list| list.iter().any(|l| l.id == id))
    }

    // --- Removal ---

    /// Remove listener `id` from the given paths.
    pub fn unsubscribe<P: Into<PathList>>(&self, paths: P, id: ListenerId) {
        let removed: Vec<Listener> = {
            let mut listeners = self.inner.listeners.lock();
            paths
                .into()
                .iter()
                .flat_map(|path| listeners.remove(path, |l| l.id == id))
                .collect()
        };
        run_cleanups(removed);
    }

    /// Remove every listener on the given paths.
    pub fn unsubscribe_path<P: Into<PathList>>(&self, paths: P) {
        let removed: Vec<Listener> = {
            let mut listeners = self.inner.listeners.lock();
            paths
                .into()
                .iter()
                .flat_map(|path| listeners.remove(path, |_| true))
                .collect()
        };
        run_cleanups(removed);
    }

    /// Remove every listener on every path.
    pub fn unsubscribe_all(&self) {
        let removed = self.inner.listeners.lock().take_all();
        run_cleanups(removed);
    }

    /// Remove a listener from one exact path (no list splitting).
    pub(crate) fn unsubscribe_exact(&self, path: &str, id: ListenerId) {
        let removed = self.inner.listeners.lock().remove(path, |l| l.id == id);
        run_cleanups(removed);
    }

    // --- Introspection ---

    /// Registered base paths related to `path` (ancestors, itself,
    /// descendants), in first-registration order without duplicates.
    /// `$deep` markers and the `$save` feed carry no value and are skipped.
    pub fn related_paths(&self, path: &str) -> Vec<String> {
        let listeners = self.inner.listeners.lock();
        let mut related: Vec<String> = Vec::new();
        for registered in &listeners.order {
            let (base, selector) = path::split(registered);
            if matches!(
                selector.and_then(Selector::parse),
                Some(Selector::Deep | Selector::Save)
            ) {
                continue;
            }
            if path::is_related(base, path) && !related.iter().any(|r| r == base) {
                related.push(base.to_string());
            }
        }
        related
    }

    /// Whether any registered path starts with `prefix`.
    pub(crate) fn has_listener_prefix(&self, prefix: &str) -> bool {
        self.inner
            .listeners
            .lock()
            .order
            .iter()
            .any(|p| p.starts_with(prefix))
    }

    /// Total number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .by_path
            .values()
            .map(Vec::len)
            .sum()
    }

    // --- Delivery ---

    /// Deliver `value` to the listeners on `path`, and its key list to the
    /// `path$keys` listeners when the key set changed since last time.
    pub fn notify(&self, path: &str, value: Option<&Value>) {
        let mut keys = keys_of(value);
        keys.sort();
        let joined = keys.join(",");

        let (direct, keyed) = {
            let mut listeners = self.inner.listeners.lock();
            let direct = listeners.callbacks(path);
            let keys_path = Selector::Keys.on(path);
            let watched = listeners.by_path.contains_key(&keys_path);
            let keyed = if watched && listeners.last_keys.get(path) != Some(&joined) {
                listeners.last_keys.insert(path.to_string(), joined);
                listeners.callbacks(&keys_path)
            } else {
                Vec::new()
            };
            (direct, keyed)
        };

        for callback in &direct {
            callback(value);
        }
        if !keyed.is_empty() {
            let keys = Value::from(keys);
            for callback in &keyed {
                callback(Some(&keys));
            }
        }
    }

    /// Push the current value of every path related to `path` to its
    /// listeners, debounced or right away.
    pub fn publish(&self, path: &str, debounced: bool) {
        for key in self.related_paths(path) {
            if debounced {
                let registry = self.downgrade();
                let lookup = key.clone();
                self.debounce_notify(
                    &key,
                    Payload::lazy(move || registry.upgrade().and_then(|r| r.resolve(&lookup))),
                    FlushDelay::Default,
                );
            } else {
                let value = self.resolve(&key);
                self.notify(&key, value.as_ref());
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

fn run_cleanups(removed: Vec<Listener>) {
    for listener in removed {
        if let Some(cleanup) = listener.cleanup {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<Option<Value>>>>, impl Fn(Option<&Value>) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |value: Option<&Value>| sink.lock().push(value.cloned()))
    }

    #[test]
    fn test_related_paths_empty() {
        let registry = SubscriptionRegistry::default();
        assert!(registry.related_paths("").is_empty());
        assert!(registry.related_paths("a").is_empty());
    }

    #[test]
    fn test_related_paths() {
        let registry = SubscriptionRegistry::default();
        registry.subscribe("a", |_| {});
        registry.subscribe("a.b", |_| {});
        registry.subscribe("a$meta", |_| {});
        registry.subscribe("c.d", |_| {});

        assert_eq!(registry.related_paths(""), vec!["a", "a.b", "c.d"]);
        assert_eq!(registry.related_paths("a"), vec!["a", "a.b"]);
        assert_eq!(registry.related_paths("a.b"), vec!["a", "a.b"]);
        assert_eq!(registry.related_paths("a.c"), vec!["a"]);
        assert_eq!(registry.related_paths("c"), vec!["c.d"]);
    }

    #[test]
    fn test_related_paths_respect_segments() {
        let registry = SubscriptionRegistry::default();
        registry.subscribe("ab", |_| {});
        registry.subscribe("a", |_| {});
        assert_eq!(registry.related_paths("a.x"), vec!["a"]);
        assert_eq!(registry.related_paths("abc"), Vec::<String>::new());
    }

    #[test]
    fn test_subscribe_lists() {
        let registry = SubscriptionRegistry::default();
        registry.subscribe(["a", "b"], |_| {});
        registry.subscribe("c$meta, d.e,f", |_| {});
        assert_eq!(registry.related_paths(""), vec!["a", "b", "c", "d.e", "f"]);
        assert_eq!(registry.listener_count(), 5);
    }

    #[test]
    fn test_subscribe_ignores_empty_paths() {
        let registry = SubscriptionRegistry::default();
        registry.subscribe("", |_| {});
        registry.subscribe(" , ", |_| {});
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_unsubscribe_one_listener() {
        let registry = SubscriptionRegistry::default();
        let (seen, callback) = recorder();
        let id = registry.subscribe("a", callback);
        registry.subscribe("a", |_| {});
        registry.unsubscribe("a", id);
        registry.notify("a", Some(&json!({"data": "important"})));

        assert_eq!(registry.related_paths("a"), vec!["a"]);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_unsubscribe_ignores_unknown_paths() {
        let registry = SubscriptionRegistry::default();
        let id = registry.subscribe("c", |_| {});
        registry.unsubscribe("b", id);
        registry.unsubscribe_path("b");
        assert_eq!(registry.related_paths(""), vec!["c"]);
    }

    #[test]
    fn test_unsubscribe_path_and_all() {
        let registry = SubscriptionRegistry::default();
        registry.subscribe("a", |_| {});
        registry.subscribe("a", |_| {});
        registry.subscribe("b", |_| {});
        registry.subscribe("c", |_| {});
        registry.unsubscribe_path(["a", "c"]);
        assert_eq!(registry.related_paths(""), vec!["b"]);

        registry.unsubscribe_all();
        assert!(registry.related_paths("").is_empty());
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_unsubscribe_runs_cleanup() {
        let registry = SubscriptionRegistry::default();
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let id = registry.next_id();
        registry.register(
            "a",
            id,
            Arc::new(|_: Option<&Value>| {}),
            Some(Arc::new(move || flag.store(true, Ordering::SeqCst))),
        );
        registry.unsubscribe_all();
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_notify_direct_and_keys() {
        let registry = SubscriptionRegistry::default();
        let (a_seen, a_cb) = recorder();
        let (keys_seen, keys_cb) = recorder();
        let (b_seen, b_cb) = recorder();
        registry.subscribe("a", a_cb);
        registry.subscribe("a$keys", keys_cb);
        registry.subscribe("b", b_cb);

        let data = json!({"b": 2, "a": 1});
        registry.notify("a", Some(&data));

        assert_eq!(*a_seen.lock(), vec![Some(data)]);
        assert_eq!(*keys_seen.lock(), vec![Some(json!(["a", "b"]))]);
        assert!(b_seen.lock().is_empty());
    }

    #[test]
    fn test_notify_suppresses_unchanged_key_sets() {
        let registry = SubscriptionRegistry::default();
        let (keys_seen, keys_cb) = recorder();
        registry.subscribe("a$keys", keys_cb);

        registry.notify("a", Some(&json!({"x": 1})));
        registry.notify("a", Some(&json!({"x": 2})));
        registry.notify("a", Some(&json!({"x": 2, "y": 3})));
        registry.notify("a", None);

        assert_eq!(
            *keys_seen.lock(),
            vec![
                Some(json!(["x"])),
                Some(json!(["x", "y"])),
                Some(json!([])),
            ]
        );
    }

    #[test]
    fn test_related_paths_skip_markers_and_feeds() {
        let registry = SubscriptionRegistry::default();
        registry.subscribe("$save", |_| {});
        registry.subscribe_deep("a", 1, |_, _| {}).unwrap();
        assert_eq!(registry.related_paths("a.b"), vec!["a"]);
    }

    #[test]
    fn test_keys_listener_caught_up_is_not_told_again() {
        let registry = SubscriptionRegistry::default();
        registry.set_resolver(|path: &str| (path == "a$keys").then(|| json!(["y", "x"])));
        let (seen, callback) = recorder();
        registry.subscribe("a$keys", callback);

        registry.notify("a", Some(&json!({"x": 1, "y": 2})));
        registry.notify("a", Some(&json!({"x": 1})));

        assert_eq!(*seen.lock(), vec![Some(json!(["y", "x"])), Some(json!(["x"]))]);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let registry = SubscriptionRegistry::default();
        let (seen, callback) = recorder();
        registry.subscribe_once("a", callback);

        let data = json!({"data": "important"});
        registry.notify("a", Some(&data));
        registry.notify("a", Some(&data));

        assert_eq!(*seen.lock(), vec![Some(data)]);
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_channel_subscription() {
        let registry = SubscriptionRegistry::default();
        let handle = registry.subscribe_channel("a", 4);

        registry.notify("a", Some(&json!(1)));
        assert_eq!(
            handle.try_recv().unwrap(),
            ValueEvent::Value {
                path: "a".to_string(),
                value: Some(json!(1)),
            }
        );

        registry.unsubscribe("a", handle.id);
        assert_eq!(
            handle.try_recv().unwrap(),
            ValueEvent::Dropped {
                reason: DropReason::Unsubscribed,
            }
        );
    }

    #[test]
    fn test_channel_drops_slow_consumer() {
        let registry = SubscriptionRegistry::default();
        let handle = registry.subscribe_channel("a", 2);

        for i in 0..10 {
            registry.notify("a", Some(&json!(i)));
        }

        assert_eq!(registry.listener_count(), 0);
        assert_eq!(handle.receiver.len(), 2);
    }
}
