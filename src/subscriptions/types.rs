//! Subscription types for live path updates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a registered listener.
///
/// A callback registered on several paths in one call shares one id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives the current value of a path; `None` means the path is gone.
pub type ValueCallback = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

/// Receives `(relative_path, value)` from a deep subscription.
pub type DeepCallback = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// Looks up the current value of a path (selectors included).
pub type Resolver = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// Runs when a listener is removed from the registry.
pub type Cleanup = Arc<dyn Fn() + Send + Sync>;

/// Future returned by a lazy payload producer.
pub type ProducerFuture = Pin<Box<dyn Future<Output = Option<Value>> + Send>>;

/// What a debounced notification carries.
pub enum Payload {
    /// A value known up front.
    Value(Option<Value>),
    /// Computed at flush time; may resolve asynchronously.
    Producer(Box<dyn FnOnce() -> ProducerFuture + Send>),
}

impl Payload {
    pub fn value(value: impl Into<Option<Value>>) -> Self {
        Payload::Value(value.into())
    }

    /// Asynchronous producer.
    pub fn producer<F, Fut>(produce: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        Payload::Producer(Box::new(move || Box::pin(produce())))
    }

    /// Synchronous producer, evaluated at flush time.
    pub fn lazy<F>(produce: F) -> Self
    where
        F: FnOnce() -> Option<Value> + Send + 'static,
    {
        Payload::Producer(Box::new(move || {
            let value = produce();
            Box::pin(async move { value })
        }))
    }

    pub(crate) fn is_producer(&self) -> bool {
        matches!(self, Payload::Producer(_))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Payload::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// When a debounced notification is flushed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushDelay {
    /// The registry's configured debounce window.
    #[default]
    Default,
    /// A specific window.
    After(Duration),
    /// No window; flush now.
    Immediate,
}

/// Events delivered through a [`SubscriptionHandle`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueEvent {
    /// The subscribed path has a new value (`None` = removed).
    Value { path: String, value: Option<Value> },
    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a channel subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Handle to a channel-backed subscription, for consumers that pull events
/// from their own thread (protocol bridges, mostly).
pub struct SubscriptionHandle {
    pub id: ListenerId,
    pub path: String,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<ValueEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ValueEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ValueEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ValueEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
