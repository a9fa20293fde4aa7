//! Core types for the live store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::ops::Add;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

/// Wall-clock anchor taken on first use; later readings advance it with
/// Tokio's monotonic clock so that paused-time runtimes see a consistent
/// timeline.
static CLOCK_ANCHOR: OnceLock<(u64, tokio::time::Instant)> = OnceLock::new();

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let (epoch_ms, anchor) = *CLOCK_ANCHOR.get_or_init(|| {
            let epoch_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            (epoch_ms, tokio::time::Instant::now())
        });
        let elapsed = tokio::time::Instant::now().saturating_duration_since(anchor);
        Timestamp(epoch_ms + elapsed.as_millis() as u64)
    }

    /// Time remaining until `later`, zero if `later` has already passed.
    pub fn until(self, later: Timestamp) -> Duration {
        Duration::from_millis(later.0.saturating_sub(self.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Metadata kept for every path that was the direct target of a write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// When the entry becomes eligible for the sweep (None = never).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    /// Exempt from expiration.
    #[serde(default, skip_serializing_if = "is_false")]
    pub permanent: bool,
    /// Last write or touch.
    pub written_at: Timestamp,
}

impl Meta {
    /// Whether this record is past its deadline at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        !self.permanent && self.expires_at.map_or(false, |at| at < now)
    }
}

/// Caller-supplied overrides merged into the metadata of a write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent: Option<bool>,
}

impl MetaPatch {
    /// Never expire this entry.
    pub fn permanent() -> Self {
        Self {
            permanent: Some(true),
            ..Default::default()
        }
    }

    /// Expire at an absolute time.
    pub fn expires_at(at: Timestamp) -> Self {
        Self {
            expires_at: Some(at),
            ..Default::default()
        }
    }

    /// Expire `ttl` from now.
    pub fn expire_in(ttl: Duration) -> Self {
        Self::expires_at(Timestamp::now() + ttl)
    }

    /// Parse a patch out of a loosely-typed JSON value; anything that does
    /// not look like a patch is ignored.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Closed set of type tags reported by the `$type` selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Array,
    Object,
    String,
    Number,
    Boolean,
    Undefined,
}

impl ValueType {
    /// Tag a value; `null` and missing values are both undefined.
    pub fn of(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Array(_)) => ValueType::Array,
            Some(Value::Object(_)) => ValueType::Object,
            Some(Value::String(_)) => ValueType::String,
            Some(Value::Number(_)) => ValueType::Number,
            Some(Value::Bool(_)) => ValueType::Boolean,
            Some(Value::Null) | None => ValueType::Undefined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Undefined => "undefined",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Child keys of a container: object keys, or array indices as strings.
pub fn keys_of(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        Some(Value::Array(items)) => (0..items.len()).map(|i| i.to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Number of children of a container, zero for scalars.
pub fn size_of(value: Option<&Value>) -> usize {
    match value {
        Some(Value::Object(map)) => map.len(),
        Some(Value::Array(items)) => items.len(),
        _ => 0,
    }
}

/// Absent, or a container with no children. Writing such a value deletes.
pub fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

/// Deep equality used for touch detection.
///
/// Values with different type tags are never equal, so an array never
/// equals an object with numeric keys. Numbers compare by value, so `1`
/// equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, a)| y.get(k).map_or(false, |b| values_equal(a, b)))
        }
        _ => false,
    }
}
