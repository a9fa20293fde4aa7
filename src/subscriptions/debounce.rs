//! Per-path notification coalescing.
//!
//! Each path owns at most one pending payload and one timer. A new request
//! replaces the pending payload and restarts the timer. Producer payloads are
//! resolved at flush time; requests that arrive while a producer is still
//! resolving are parked (latest wins) and flushed as soon as it settles.

use std::collections::HashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::manager::SubscriptionRegistry;
use super::types::{FlushDelay, Payload};

#[derive(Default)]
pub(crate) struct DebounceSlot {
    /// Identifies the armed timer; stale timers compare unequal.
    generation: u64,
    pending: Option<Payload>,
    timer: Option<JoinHandle<()>>,
    /// A producer from an earlier flush is still resolving.
    in_flight: bool,
    queued: Option<Payload>,
}

impl DebounceSlot {
    fn is_idle(&self) -> bool {
        !self.in_flight && self.timer.is_none() && self.pending.is_none() && self.queued.is_none()
    }
}

/// Debounce state for every path with outstanding work.
#[derive(Default)]
pub(crate) struct Debounces {
    /// Generations are registry-wide so a recreated slot never matches an
    /// old timer.
    next_generation: u64,
    slots: HashMap<String, DebounceSlot>,
}

impl Debounces {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn remove_if_idle(&mut self, path: &str) {
        if self.slots.get(path).map_or(false, DebounceSlot::is_idle) {
            self.slots.remove(path);
        }
    }
}

impl SubscriptionRegistry {
    /// Coalesce notifications for `path`.
    ///
    /// Ignored when no registered path starts with `path`. With
    /// [`FlushDelay::Immediate`] (or outside a Tokio runtime) the flush
    /// happens before this call returns, unless a producer is still
    /// resolving for the path, in which case the request is queued.
    pub fn debounce_notify(&self, path: &str, payload: Payload, delay: FlushDelay) {
        if !self.has_listener_prefix(path) {
            trace!(path, "debounce skipped, no listeners");
            return;
        }
        let window = match delay {
            FlushDelay::Default => Some(self.inner.debounce),
            FlushDelay::After(window) => Some(window),
            FlushDelay::Immediate => None,
        };
        let runtime = Handle::try_current().ok();

        let mut debounces = self.inner.debounces.lock();
        debounces.next_generation += 1;
        let generation = debounces.next_generation;
        let slot = debounces.slots.entry(path.to_string()).or_default();

        if slot.in_flight {
            trace!(path, "producer in flight, request queued");
            slot.queued = Some(payload);
            return;
        }
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.generation = generation;
        slot.pending = None;

        match (window, runtime) {
            (Some(window), Some(runtime)) => {
                slot.pending = Some(payload);
                let registry = self.downgrade();
                let key = path.to_string();
                slot.timer = Some(runtime.spawn(async move {
                    tokio::time::sleep(window).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.fire(&key, generation);
                    }
                }));
            }
            _ => {
                if payload.is_producer() {
                    slot.in_flight = true;
                } else {
                    debounces.remove_if_idle(path);
                }
                drop(debounces);
                self.flush(path, payload);
            }
        }
    }

    /// Timer callback: flush the pending payload unless a newer request
    /// re-armed the slot in the meantime.
    fn fire(&self, path: &str, generation: u64) {
        let payload = {
            let mut debounces = self.inner.debounces.lock();
            let Some(slot) = debounces.slots.get_mut(path) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            slot.timer = None;
            let Some(payload) = slot.pending.take() else {
                return;
            };
            if payload.is_producer() {
                slot.in_flight = true;
            } else {
                debounces.remove_if_idle(path);
            }
            payload
        };
        self.flush(path, payload);
    }

    fn flush(&self, path: &str, payload: Payload) {
        match payload {
            Payload::Value(value) => self.notify(path, value.as_ref()),
            Payload::Producer(produce) => {
                let future = produce();
                match Handle::try_current() {
                    Ok(runtime) => {
                        let registry = self.downgrade();
                        let key = path.to_string();
                        runtime.spawn(async move {
                            let value = future.await;
                            if let Some(registry) = registry.upgrade() {
                                registry.notify(&key, value.as_ref());
                                registry.settle(&key);
                            }
                        });
                    }
                    Err(_) => {
                        warn!(path, "no async runtime, producer payload dropped");
                        self.settle(path);
                    }
                }
            }
        }
    }

    /// A producer finished; flush whatever queued up behind it.
    fn settle(&self, path: &str) {
        let queued = {
            let mut debounces = self.inner.debounces.lock();
            let queued = debounces.slots.get_mut(path).and_then(|slot| {
                slot.in_flight = false;
                slot.queued.take()
            });
            debounces.remove_if_idle(path);
            queued
        };
        if let Some(payload) = queued {
            self.debounce_notify(path, payload, FlushDelay::Immediate);
        }
    }

    /// Paths with outstanding debounce work.
    pub fn pending_debounces(&self) -> usize {
        self.inner.debounces.lock().len()
    }
}
