use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keyword arguments of an event, kept in insertion order.
pub type EventArgs = Map<String, Value>;

/// An application event replicated across the cluster.
///
/// The timestamp (seconds since epoch) doubles as the per-node version number
/// recorded in the version vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: f64,
    pub name: String,
    pub args: EventArgs,
}

impl Event {
    /// Create an event stamped with the current wall-clock time.
    pub fn new(name: impl Into<String>, args: EventArgs) -> Self {
        Self::with_timestamp(now_seconds(), name, args)
    }

    pub fn with_timestamp(timestamp: f64, name: impl Into<String>, args: EventArgs) -> Self {
        Self {
            timestamp,
            name: name.into(),
            args,
        }
    }
}

/// Current time as fractional seconds since the Unix epoch.
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Build an [`EventArgs`] map from `(key, value)` pairs.
pub fn args<K, V, I>(pairs: I) -> EventArgs
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
