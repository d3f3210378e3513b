//! Identifiers and settings used to index managed connections.

use dashmap::DashSet;
use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Connector family a connection belongs to (e.g. the protocol name)
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionType(pub String);

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for ConnectionType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identifier of the connector instance relying on a connection
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectorId(pub String);

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&ConnectorId> for ConnectorId {
    fn from(value: &ConnectorId) -> Self {
        value.clone()
    }
}

impl Borrow<str> for ConnectorId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Connector-defined connection settings, compared structurally.
///
/// Settings are stored as plain JSON data, so anything that cannot be
/// serialized (live handles, closures, cyclic graphs) is rejected when the
/// settings are built. Object key order does not matter, and numbers compare
/// by value: integral floats are stored as integers, so `1` equals `1.0`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ConnectionSettings(serde_json::Value);

impl ConnectionSettings {
    /// Build settings from any serializable value
    pub fn from_serialize<T: Serialize + ?Sized>(settings: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(settings).map(Self::from)
    }

    /// Plain-data view of the settings
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for ConnectionSettings {
    fn from(value: serde_json::Value) -> Self {
        Self(normalize_numbers(value))
    }
}

fn normalize_numbers(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::Number(number) if number.is_f64() => match number.as_f64() {
            // Range check keeps the cast exact
            Some(float) if float.fract() == 0.0 && float >= i64::MIN as f64 && float < i64::MAX as f64 => {
                Value::from(float as i64)
            }
            _ => Value::Number(number),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, normalize_numbers(value)))
                .collect(),
        ),
        other => other,
    }
}

/// Set of connectors relying on one managed connection.
///
/// Cloning shares the underlying set: the registry record and its session
/// must observe the same instance.
#[derive(Clone, Debug, Default)]
pub struct ReliantConnectors(Arc<DashSet<ConnectorId>>);

impl ReliantConnectors {
    /// Create a set containing a single connector
    pub fn with_connector(connector_id: ConnectorId) -> Self {
        let set = DashSet::new();
        set.insert(connector_id);
        Self(Arc::new(set))
    }

    /// Add a connector, returning false if it was already present
    pub fn insert(&self, connector_id: ConnectorId) -> bool {
        self.0.insert(connector_id)
    }

    /// Remove a connector, returning true if it was present
    pub fn remove(&self, connector_id: &str) -> bool {
        self.0.remove(connector_id).is_some()
    }

    /// Whether the connector relies on this connection
    pub fn contains(&self, connector_id: &str) -> bool {
        self.0.contains(connector_id)
    }

    /// Number of reliant connectors
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no connector relies on this connection anymore
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> std::collections::BTreeSet<String> {
        self.0.iter().map(|id| id.0.clone()).collect()
    }
}
