//! Main Store struct tying the tree, metadata, listeners and expiry together.

use crate::error::{Result, StoreError};
use crate::expiry::{ExpirationScheduler, SchedulerConfig};
use crate::path::{self, PathList, Selector};
use crate::subscriptions::{
    FlushDelay, ListenerId, Payload, SubscriptionHandle, SubscriptionRegistry,
};
use crate::tree::{leaf_paths, tree_del, tree_get, tree_lookup, tree_set};
use crate::types::{is_empty, values_equal, Meta, MetaPatch, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Lifetime of a written entry unless the write says otherwise.
    pub default_expire: Duration,

    /// Window used to coalesce notifications.
    pub debounce: Duration,

    /// Disable expiration for every entry.
    pub permanent: bool,

    /// Shortest delay the expiration timer is armed with.
    pub min_expire_delay: Duration,

    /// Longest gap between two sweeps.
    pub upkeep_window: Duration,

    /// Quiet period before the `$save` feed publishes after a change.
    pub save_delay: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_expire: Duration::from_secs(600),
            debounce: Duration::from_millis(10),
            permanent: false,
            min_expire_delay: Duration::from_millis(500),
            upkeep_window: Duration::from_secs(30),
            save_delay: Duration::from_secs(5),
        }
    }
}

/// Events reported to a [`DebugSink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugEvent {
    /// A path was written with a new value.
    Write { path: String },
    /// A path was re-written with an equal value.
    Touch { path: String },
    /// A path was removed by the sweep.
    Sweep { path: String },
}

/// Receives store activity, for external logging.
pub trait DebugSink: Send + Sync {
    fn log(&self, event: &DebugEvent);
}

impl<F> DebugSink for F
where
    F: Fn(&DebugEvent) + Send + Sync,
{
    fn log(&self, event: &DebugEvent) {
        self(event)
    }
}

/// Data and metadata of a store, detached from it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub data: Map<String, Value>,
    /// Metadata records in insertion order.
    pub meta: Vec<(String, Meta)>,
}

impl Snapshot {
    /// Parse a snapshot published on the `$save` feed.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

/// Insertion-ordered metadata records keyed by exact written path.
#[derive(Default)]
pub(crate) struct MetaTable {
    next_order: u64,
    entries: HashMap<String, (u64, Meta)>,
}

impl MetaTable {
    pub(crate) fn get(&self, path: &str) -> Option<&Meta> {
        self.entries.get(path).map(|(_, meta)| meta)
    }

    /// Insert or replace; a replaced record keeps its position.
    pub(crate) fn upsert(&mut self, path: &str, meta: Meta) {
        match self.entries.get_mut(path) {
            Some(entry) => entry.1 = meta,
            None => {
                self.next_order += 1;
                self.entries
                    .insert(path.to_string(), (self.next_order, meta));
            }
        }
    }

    pub(crate) fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    /// Remove the records strictly below `path`.
    pub(crate) fn remove_descendants(&mut self, path: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|key| path::is_ancestor(path, key))
            .cloned()
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        doomed
    }

    /// Remove the record of `path` and every record below it.
    pub(crate) fn remove_tree(&mut self, path: &str) -> Vec<String> {
        let mut removed = self.remove_descendants(path);
        if self.remove(path) {
            removed.push(path.to_string());
        }
        removed
    }

    /// The record of `path`, or of its nearest ancestor that has one.
    pub(crate) fn governing(&self, path: &str) -> Option<&Meta> {
        let mut current = Some(path);
        while let Some(key) = current {
            if let Some(meta) = self.get(key) {
                return Some(meta);
            }
            current = path::parent(key);
        }
        None
    }

    /// Records in insertion order.
    pub(crate) fn ordered(&self) -> Vec<(String, Meta)> {
        let mut rows: Vec<(&u64, &String, &Meta)> = self
            .entries
            .iter()
            .map(|(path, (order, meta))| (order, path, meta))
            .collect();
        rows.sort_by_key(|(order, _, _)| **order);
        rows.into_iter()
            .map(|(_, path, meta)| (path.clone(), meta.clone()))
            .collect()
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct StoreState {
    pub(crate) data: Map<String, Value>,
    pub(crate) meta: MetaTable,
}

/// `$save` publication switch.
#[derive(Default)]
struct SaveHold {
    held: bool,
    /// A change arrived while held.
    pending: bool,
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    pub(crate) state: RwLock<StoreState>,
    registry: SubscriptionRegistry,
    scheduler: ExpirationScheduler,
    debug_sink: RwLock<Option<Arc<dyn DebugSink>>>,
    save_hold: Mutex<SaveHold>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

/// The live store.
///
/// Provides a unified interface for:
/// - Reading and writing paths of a JSON tree
/// - Per-path expiration with a single adaptive timer
/// - Path listeners with debounced delivery
/// - Line-delimited JSON backup and restore
///
/// Cheap to clone; clones share everything. A store must be created inside
/// a Tokio runtime for its timers to run, and stops its expiration timer
/// once the last clone is dropped.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        Self::from_snapshot(config, Snapshot::default())
    }

    /// Create a store seeded with existing data and metadata.
    pub fn from_snapshot(config: StoreConfig, snapshot: Snapshot) -> Self {
        let mut meta = MetaTable::default();
        for (path, record) in snapshot.meta {
            meta.upsert(&path, record);
        }

        let inner = Arc::new_cyclic(|weak: &Weak<StoreInner>| {
            let registry = SubscriptionRegistry::new(config.debounce);
            let resolver = weak.clone();
            registry.set_resolver(move |path: &str| {
                resolver
                    .upgrade()
                    .and_then(|inner| Store { inner }.get(path))
            });

            let upcoming = weak.clone();
            let sweeper = weak.clone();
            let scheduler = ExpirationScheduler::new(
                SchedulerConfig {
                    min_delay: config.min_expire_delay,
                    upkeep_window: config.upkeep_window,
                },
                move |horizon| {
                    upcoming
                        .upgrade()
                        .map(|inner| {
                            Store { inner }
                                .find_expiring(horizon)
                                .into_iter()
                                .map(|(_, at)| at)
                                .collect()
                        })
                        .unwrap_or_default()
                },
                move |_now| {
                    let store = sweeper.upgrade().map(|inner| Store { inner });
                    async move {
                        let store = store.ok_or(StoreError::StoreClosed)?;
                        store.sweep();
                        Ok::<(), StoreError>(())
                    }
                },
            );

            StoreInner {
                config,
                state: RwLock::new(StoreState {
                    data: snapshot.data,
                    meta,
                }),
                registry,
                scheduler,
                debug_sink: RwLock::new(None),
                save_hold: Mutex::new(SaveHold::default()),
            }
        });

        inner.scheduler.start();
        Self { inner }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The listener registry behind this store.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// The expiration scheduler behind this store.
    pub fn scheduler(&self) -> &ExpirationScheduler {
        &self.inner.scheduler
    }

    /// Install a sink receiving write, touch and sweep events.
    pub fn set_debug_sink(&self, sink: Arc<dyn DebugSink>) {
        *self.inner.debug_sink.write() = Some(sink);
    }

    fn report(&self, event: DebugEvent) {
        let sink = self.inner.debug_sink.read().clone();
        if let Some(sink) = sink {
            sink.log(&event);
        }
    }

    // --- Reads ---

    /// Read a path.
    ///
    /// Supports the `$keys`, `$type`, `$size` and `$meta` selectors, and
    /// `$save` on the root for the whole [`Snapshot`]; other selectors read
    /// as `None`. The empty path reads the whole tree.
    pub fn get(&self, path: &str) -> Option<Value> {
        let state = self.inner.state.read();
        match path::split(path) {
            (key, Some(selector)) => match Selector::parse(selector) {
                Some(Selector::Meta) => state
                    .meta
                    .get(key)
                    .and_then(|meta| serde_json::to_value(meta).ok()),
                Some(Selector::Save) if key.is_empty() => serde_json::to_value(Snapshot {
                    data: state.data.clone(),
                    meta: state.meta.ordered(),
                })
                .ok(),
                _ => tree_get(&state.data, path),
            },
            _ => tree_get(&state.data, path),
        }
    }

    /// Metadata record of an exact written path.
    pub fn meta(&self, path: &str) -> Option<Meta> {
        self.inner.state.read().meta.get(path).cloned()
    }

    /// Number of metadata records.
    pub fn meta_len(&self) -> usize {
        self.inner.state.read().meta.len()
    }

    /// Copy of the current data and metadata.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.read();
        Snapshot {
            data: state.data.clone(),
            meta: state.meta.ordered(),
        }
    }

    // --- Writes ---

    /// Write `value` at `path` with the default lifetime.
    pub fn set(&self, path: &str, value: Value) {
        self.set_with_meta(path, value, MetaPatch::default());
    }

    /// Write `value` at `path`, overriding metadata fields from `patch`.
    ///
    /// Empty values delete the path. Writing a value equal to the current
    /// one only refreshes the metadata and notifies nobody. Invalid paths
    /// are ignored.
    pub fn set_with_meta(&self, path: &str, value: Value, patch: MetaPatch) {
        if !path::is_writable(path) {
            return;
        }
        if is_empty(Some(&value)) {
            self.del(path);
            return;
        }

        let now = Timestamp::now();
        let meta = Meta {
            expires_at: Some(patch.expires_at.unwrap_or(now + self.inner.config.default_expire)),
            permanent: patch.permanent.unwrap_or(false),
            written_at: now,
        };
        let deadline = if meta.permanent || self.inner.config.permanent {
            None
        } else {
            meta.expires_at
        };

        let touched = {
            let mut state = self.inner.state.write();
            let unchanged =
                tree_lookup(&state.data, path).map_or(false, |current| values_equal(current, &value));
            if !unchanged {
                state.meta.remove_descendants(path);
                tree_set(&mut state.data, path, value);
            }
            state.meta.upsert(path, meta);
            unchanged
        };

        if let Some(at) = deadline {
            self.inner.scheduler.arm(at);
        }
        if touched {
            debug!(path, "touch");
            self.report(DebugEvent::Touch {
                path: path.to_string(),
            });
            return;
        }

        debug!(path, "set");
        self.report(DebugEvent::Write {
            path: path.to_string(),
        });
        self.inner.registry.publish(path, true);
        self.save();
    }

    /// Write every entry of `entries`.
    ///
    /// A `key$meta` sibling supplies metadata for `key`; a `$meta` entry is
    /// the default for the whole batch. Other keys containing `$` are
    /// skipped.
    pub fn set_batch(&self, entries: &Map<String, Value>) {
        let defaults = entries
            .get(Selector::Meta.on("").as_str())
            .and_then(MetaPatch::from_value)
            .unwrap_or_default();

        for (key, value) in entries {
            if key.contains(path::SELECTOR_MARK) {
                continue;
            }
            let own = entries
                .get(&Selector::Meta.on(key))
                .and_then(MetaPatch::from_value)
                .unwrap_or_default();
            let patch = MetaPatch {
                expires_at: own.expires_at.or(defaults.expires_at),
                permanent: own.permanent.or(defaults.permanent),
            };
            self.set_with_meta(key, value.clone(), patch);
        }
    }

    /// Write a transient value: listeners are notified and the entry
    /// expires right away.
    pub fn broadcast(&self, path: &str, value: Value) {
        self.set_with_meta(path, value, MetaPatch::expire_in(Duration::from_millis(1)));
    }

    /// Delete one or more paths with their metadata and their descendants'
    /// metadata. Returns the paths that were present in the tree.
    pub fn del<P: Into<PathList>>(&self, paths: P) -> Vec<String> {
        let mut removed = Vec::new();
        let mut changed = Vec::new();
        {
            let mut state = self.inner.state.write();
            for path in paths.into().iter() {
                if !path::is_writable(path) {
                    continue;
                }
                let meta_removed = !state.meta.remove_tree(path).is_empty();
                let data_removed = tree_del(&mut state.data, path);
                if data_removed {
                    removed.push(path.to_string());
                }
                if data_removed || meta_removed {
                    changed.push(path.to_string());
                }
            }
        }

        for path in &changed {
            debug!(path = %path, "del");
            self.inner.registry.publish(path, true);
        }
        if !changed.is_empty() {
            self.save();
        }
        removed
    }

    // --- Expiration ---

    /// Non-permanent records due at or before `horizon`, in insertion order.
    pub fn find_expiring(&self, horizon: Timestamp) -> Vec<(String, Timestamp)> {
        if self.inner.config.permanent {
            return Vec::new();
        }
        self.inner
            .state
            .read()
            .meta
            .ordered()
            .into_iter()
            .filter(|(_, meta)| !meta.permanent)
            .filter_map(|(path, meta)| {
                meta.expires_at
                    .filter(|at| *at <= horizon)
                    .map(|at| (path, at))
            })
            .collect()
    }

    /// Bring data and metadata back in line and drop expired entries.
    ///
    /// Candidates are every data leaf and every metadata path, deepest
    /// first. A candidate goes when it has no value, when no record governs
    /// it (its own or its nearest ancestor's), or when the governing record
    /// has expired. Ancestors of retained paths stay as containers; an
    /// expired record of such an ancestor is dropped. Returns the removed
    /// paths.
    pub fn sweep(&self) -> Vec<String> {
        let now = Timestamp::now();
        let permanent = self.inner.config.permanent;

        let removed = {
            let mut state = self.inner.state.write();
            let mut candidates = leaf_paths(&state.data);
            let mut seen: HashSet<String> = candidates.iter().cloned().collect();
            let meta_paths: Vec<String> = state.meta.paths().cloned().collect();
            for key in meta_paths {
                if seen.insert(key.clone()) {
                    candidates.push(key);
                }
            }
            candidates.sort_by_key(|key| std::cmp::Reverse(path::depth(key)));

            let mut retained: Vec<String> = Vec::new();
            let mut removed = Vec::new();
            for key in candidates {
                let present = tree_lookup(&state.data, &key).is_some();
                if present && retained.iter().any(|r| path::is_ancestor(&key, r)) {
                    let stale = state
                        .meta
                        .get(&key)
                        .map_or(false, |meta| !permanent && meta.is_expired(now));
                    if stale {
                        state.meta.remove(&key);
                    }
                    retained.push(key);
                    continue;
                }

                let expired = !present
                    || match state.meta.governing(&key) {
                        None => true,
                        Some(meta) => !permanent && meta.is_expired(now),
                    };
                if expired {
                    tree_del(&mut state.data, &key);
                    state.meta.remove(&key);
                    removed.push(key);
                } else {
                    retained.push(key);
                }
            }
            removed
        };

        for path in &removed {
            debug!(path = %path, "swept");
            self.report(DebugEvent::Sweep { path: path.clone() });
            self.inner.registry.publish(path, true);
        }
        if !removed.is_empty() {
            self.save();
        }
        removed
    }

    // --- Change feed ---

    /// Schedule a `$save` publication once writes have been quiet for the
    /// configured delay. Deferred while held.
    fn save(&self) {
        {
            let mut hold = self.inner.save_hold.lock();
            if hold.held {
                hold.pending = true;
                return;
            }
        }
        let weak = Arc::downgrade(&self.inner);
        let feed = Selector::Save.on("");
        let lookup = feed.clone();
        self.inner.registry.debounce_notify(
            &feed,
            Payload::lazy(move || weak.upgrade().and_then(|inner| Store { inner }.get(&lookup))),
            FlushDelay::After(self.inner.config.save_delay),
        );
    }

    /// Suspend (`true`) or resume (`false`) the `$save` feed. Changes made
    /// while held are published once after resuming.
    pub fn hold_save(&self, hold: bool) {
        let resume = {
            let mut state = self.inner.save_hold.lock();
            state.held = hold;
            !hold && std::mem::take(&mut state.pending)
        };
        if resume {
            self.save();
        }
    }

    // --- Subscriptions ---

    /// Listen on one or more paths; the current value is delivered first.
    pub fn subscribe<P, F>(&self, paths: P, callback: F) -> ListenerId
    where
        P: Into<PathList>,
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(paths, callback)
    }

    /// Listen until the first delivery.
    pub fn subscribe_once<P, F>(&self, paths: P, callback: F) -> ListenerId
    where
        P: Into<PathList>,
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe_once(paths, callback)
    }

    /// Listen on every node `depth` levels below `path`.
    pub fn subscribe_deep<F>(&self, path: &str, depth: usize, callback: F) -> Option<ListenerId>
    where
        F: Fn(&str, Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe_deep(path, depth, callback)
    }

    /// Channel-backed subscription on one path.
    pub fn subscribe_channel(&self, path: &str, buffer: usize) -> SubscriptionHandle {
        self.inner.registry.subscribe_channel(path, buffer)
    }

    pub fn unsubscribe<P: Into<PathList>>(&self, paths: P, id: ListenerId) {
        self.inner.registry.unsubscribe(paths, id);
    }

    pub fn unsubscribe_path<P: Into<PathList>>(&self, paths: P) {
        self.inner.registry.unsubscribe_path(paths);
    }

    pub fn unsubscribe_deep(&self, path: &str, id: ListenerId) {
        self.inner.registry.unsubscribe_deep(path, id);
    }

    pub fn unsubscribe_all(&self) {
        self.inner.registry.unsubscribe_all();
    }

    /// Push the current values around `path` to their listeners.
    pub fn publish(&self, path: &str, debounced: bool) {
        self.inner.registry.publish(path, debounced);
    }
}
