//! Registry of managed connections, indexed by connection type.
//!
//! Each connection type maps to a list of records. A record pairs a
//! [`ManagedSession`] with the set of connectors relying on it, the settings
//! it was created with and its sharing policy. Several records may coexist
//! under one type when settings or sharing differ.

use crate::descriptor::ConnectionDescriptor;
use crate::error::ConnectionError;
use crate::session::{ManagedSession, OperationTimeouts};
use crate::types::{ConnectionSettings, ConnectionType, ConnectorId, ReliantConnectors};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct ConnectionRecord<S> {
    session: Arc<ManagedSession<S>>,
    reliant: ReliantConnectors,
    settings: ConnectionSettings,
    shared: bool,
}

impl<S> ConnectionRecord<S> {
    /// Whether a request from `connector_id` may reuse this record
    fn matches(&self, connector_id: &str, settings: &ConnectionSettings, shared: bool) -> bool {
        if self.shared != shared || &self.settings != settings {
            return false;
        }
        // Exclusive records are only reused by the connector that owns them
        shared || self.reliant.contains(connector_id)
    }
}

enum Detach<S> {
    NotAttached,
    StillReliedUpon,
    LastConnector {
        session: Arc<ManagedSession<S>>,
        reliant: ReliantConnectors,
    },
}

/// Puts a detached connector back into its record unless disarmed.
///
/// Covers both a failed close and a `remove` future dropped mid-close, so a
/// record is never left indexed with an empty set and a live session.
struct Reattach<'a> {
    reliant: &'a ReliantConnectors,
    connector_id: &'a str,
    armed: bool,
}

impl<'a> Reattach<'a> {
    fn new(reliant: &'a ReliantConnectors, connector_id: &'a str) -> Self {
        Self {
            reliant,
            connector_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reattach<'_> {
    fn drop(&mut self) {
        if self.armed {
            trace!(connector_id = self.connector_id, "Reattaching connector after unfinished close");
            self.reliant.insert(ConnectorId::from(self.connector_id));
        }
    }
}

/// Creates, shares and tears down managed connections for connectors
pub struct ConnectionRegistry<S> {
    records: DashMap<ConnectionType, Vec<ConnectionRecord<S>>>,
    timeouts: OperationTimeouts,
}

impl<S> ConnectionRegistry<S>
where
    S: Send + Sync + 'static,
{
    /// Create an empty registry without operation deadlines
    pub fn new() -> Self {
        Self::with_timeouts(OperationTimeouts::default())
    }

    /// Create an empty registry whose sessions use the given deadlines
    pub fn with_timeouts(timeouts: OperationTimeouts) -> Self {
        Self {
            records: DashMap::new(),
            timeouts,
        }
    }

    /// Attach `connector_id` to a matching connection or register a new one.
    ///
    /// The session itself is not created here; it is created on the first
    /// [`ManagedSession::get_session`] call.
    pub fn create(
        &self,
        connector_id: impl Into<ConnectorId>,
        descriptor: ConnectionDescriptor<S>,
    ) -> Arc<ManagedSession<S>> {
        let connector_id = connector_id.into();
        let ConnectionDescriptor {
            connection_type,
            settings,
            factory,
            closer,
            shared,
        } = descriptor;

        let mut records = self.records.entry(connection_type.clone()).or_default();

        if let Some(record) = records
            .iter()
            .find(|record| record.matches(&connector_id.0, &settings, shared))
        {
            record.reliant.insert(connector_id.clone());
            trace!(
                connection_type = %connection_type,
                connector_id = %connector_id,
                session = record.session.id(),
                shared,
                "Reusing managed connection"
            );
            return record.session.clone();
        }

        let reliant = ReliantConnectors::with_connector(connector_id.clone());
        let session = Arc::new(ManagedSession::new(
            connection_type.clone(),
            factory,
            closer,
            reliant.clone(),
            self.timeouts,
        ));
        records.push(ConnectionRecord {
            session: session.clone(),
            reliant,
            settings,
            shared,
        });
        debug!(
            connection_type = %connection_type,
            connector_id = %connector_id,
            session = session.id(),
            shared,
            "Registered new managed connection ({} under this type)",
            records.len()
        );

        session
    }

    /// Detach `connector_id` from its connections of type `connection_type`.
    ///
    /// Unknown types and connectors are ignored. When the last reliant
    /// connector leaves, the session is closed and the record evicted. If the
    /// close fails, or the returned future is dropped before it finishes, the
    /// connector stays attached so that a later `remove` retries the teardown.
    ///
    /// A connector normally relies on one record per type, but it can end up
    /// on two when it re-creates its connection while a failing close is in
    /// flight. Every such record is detached.
    pub async fn remove(&self, connection_type: &str, connector_id: &str) -> Result<(), ConnectionError> {
        let mut detached = 0;
        loop {
            let (session, reliant) = match self.detach(connection_type, connector_id) {
                Detach::NotAttached => break,
                Detach::StillReliedUpon => {
                    detached += 1;
                    continue;
                }
                Detach::LastConnector { session, reliant } => (session, reliant),
            };
            detached += 1;

            trace!(
                connection_type,
                session = session.id(),
                "Last reliant connector left, closing session"
            );
            let reattach = Reattach::new(&reliant, connector_id);
            if let Err(e) = session.close().await {
                warn!(
                    connection_type,
                    connector_id,
                    session = session.id(),
                    "Keeping connector attached until its session closes: {}", e
                );
                return Err(e);
            }
            reattach.disarm();

            self.evict(connection_type, &session);
        }

        if detached == 0 {
            trace!(
                connection_type,
                connector_id,
                "Connector does not rely on any managed connection"
            );
        }
        Ok(())
    }

    /// Take `connector_id` out of the first record of the type relying on it
    fn detach(&self, connection_type: &str, connector_id: &str) -> Detach<S> {
        let Some(records) = self.records.get(connection_type) else {
            return Detach::NotAttached;
        };
        let Some(record) = records
            .iter()
            .find(|record| record.reliant.contains(connector_id))
        else {
            return Detach::NotAttached;
        };

        record.reliant.remove(connector_id);
        debug!(
            connection_type,
            connector_id,
            session = record.session.id(),
            "Connector detached from managed connection ({} remaining)",
            record.reliant.len()
        );

        if record.reliant.is_empty() {
            Detach::LastConnector {
                session: record.session.clone(),
                reliant: record.reliant.clone(),
            }
        } else {
            Detach::StillReliedUpon
        }
    }

    /// Drop the record of `session` unless a connector attached during close
    fn evict(&self, connection_type: &str, session: &Arc<ManagedSession<S>>) {
        let Some(mut records) = self.records.get_mut(connection_type) else {
            return;
        };

        let before = records.len();
        records.retain(|record| {
            !(Arc::ptr_eq(&record.session, session) && record.reliant.is_empty())
        });

        if records.len() == before {
            debug!(
                connection_type,
                session = session.id(),
                "Managed connection picked up a new connector while closing, keeping it"
            );
        } else {
            debug!(
                connection_type,
                session = session.id(),
                "Managed connection evicted"
            );
        }

        let now_empty = records.is_empty();
        drop(records);
        if now_empty {
            self.records
                .remove_if(connection_type, |_, records| records.is_empty());
        }
    }
}

impl<S> Default for ConnectionRegistry<S>
where
    S: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for ConnectionRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_types", &self.records.len())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{TestCloser, TestFactory, TestSession};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;
    use tokio::sync::Notify;

    fn descriptor(
        connection_type: &str,
        settings: serde_json::Value,
        shared: bool,
        factory: &Arc<TestFactory>,
        closer: &Arc<TestCloser>,
    ) -> ConnectionDescriptor<TestSession> {
        ConnectionDescriptor {
            connection_type: connection_type.into(),
            settings: settings.into(),
            factory: factory.clone(),
            closer: closer.clone(),
            shared,
        }
    }

    fn reliant_of(
        registry: &ConnectionRegistry<TestSession>,
        connection_type: &str,
        session: &Arc<ManagedSession<TestSession>>,
    ) -> Option<BTreeSet<String>> {
        registry.records.get(connection_type).and_then(|records| {
            records
                .iter()
                .find(|record| Arc::ptr_eq(&record.session, session))
                .map(|record| record.reliant.snapshot())
        })
    }

    fn record_count(registry: &ConnectionRegistry<TestSession>, connection_type: &str) -> usize {
        registry
            .records
            .get(connection_type)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    fn ids(ids: &[&str]) -> Option<BTreeSet<String>> {
        Some(ids.iter().map(|id| id.to_string()).collect())
    }

    #[tokio::test]
    async fn test_shared_connection_is_reused() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser::default());

        let a = registry.create("south-a", descriptor("opcua", json!({ "url": "opc.tcp://plc" }), true, &factory, &closer));
        let b = registry.create("south-b", descriptor("opcua", json!({ "url": "opc.tcp://plc" }), true, &factory, &closer));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reliant_of(&registry, "opcua", &a), ids(&["south-a", "south-b"]));
        assert_eq!(record_count(&registry, "opcua"), 1);
    }

    #[tokio::test]
    async fn test_exclusive_connections_are_not_shared() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser::default());

        let c1 = registry.create("c1", descriptor("x", json!({ "host": "a" }), false, &factory, &closer));
        let c2 = registry.create("c2", descriptor("x", json!({ "host": "a" }), false, &factory, &closer));

        assert!(!Arc::ptr_eq(&c1, &c2));
        assert_eq!(reliant_of(&registry, "x", &c1), ids(&["c1"]));
        assert_eq!(reliant_of(&registry, "x", &c2), ids(&["c2"]));

        let first = c1.get_session().await.unwrap();
        let second = c2.get_session().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        // Tearing down the first never touches the second
        registry.remove("x", "c1").await.unwrap();
        assert!(!c1.is_connected().await);
        assert!(Arc::ptr_eq(&second, &c2.get_session().await.unwrap()));
        assert_eq!(closer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exclusive_create_is_idempotent_per_connector() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser::default());

        let first = registry.create("c1", descriptor("x", json!({ "host": "a" }), false, &factory, &closer));
        let again = registry.create("c1", descriptor("x", json!({ "host": "a" }), false, &factory, &closer));

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(record_count(&registry, "x"), 1);
        assert_eq!(reliant_of(&registry, "x", &first), ids(&["c1"]));
    }

    #[tokio::test]
    async fn test_settings_and_policy_separate_records() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser::default());

        let shared_a = registry.create("c1", descriptor("x", json!({ "host": "a" }), true, &factory, &closer));
        let shared_b = registry.create("c2", descriptor("x", json!({ "host": "b" }), true, &factory, &closer));
        let exclusive_a = registry.create("c3", descriptor("x", json!({ "host": "a" }), false, &factory, &closer));
        let other_type = registry.create("c4", descriptor("y", json!({ "host": "a" }), true, &factory, &closer));

        assert!(!Arc::ptr_eq(&shared_a, &shared_b));
        assert!(!Arc::ptr_eq(&shared_a, &exclusive_a));
        assert!(!Arc::ptr_eq(&shared_a, &other_type));
        assert_eq!(record_count(&registry, "x"), 3);
        assert_eq!(record_count(&registry, "y"), 1);
    }

    #[tokio::test]
    async fn test_shared_connection_closed_by_last_connector() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser::default());

        let handle = registry.create("south-a", descriptor("mqtt", json!({ "url": "mqtt://broker" }), true, &factory, &closer));
        registry.create("south-b", descriptor("mqtt", json!({ "url": "mqtt://broker" }), true, &factory, &closer));
        handle.get_session().await.unwrap();

        registry.remove("mqtt", "south-a").await.unwrap();
        assert_eq!(closer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(reliant_of(&registry, "mqtt", &handle), ids(&["south-b"]));
        assert!(handle.is_connected().await);

        registry.remove("mqtt", "south-b").await.unwrap();
        assert_eq!(closer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(record_count(&registry, "mqtt"), 0);
        assert!(registry.records.get("mqtt").is_none());
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn test_unused_session_evicted_without_close() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser::default());

        registry.create("c1", descriptor("sql", json!({ "dsn": "db" }), false, &factory, &closer));
        registry.remove("sql", "c1").await.unwrap();

        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
        assert_eq!(closer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(record_count(&registry, "sql"), 0);
    }

    #[tokio::test]
    async fn test_remove_lookup_miss_is_noop() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser::default());

        registry.remove("unknown", "c1").await.unwrap();

        let handle = registry.create("c1", descriptor("x", json!({}), false, &factory, &closer));
        registry.remove("x", "someone-else").await.unwrap();
        registry.remove("y", "c1").await.unwrap();
        assert_eq!(reliant_of(&registry, "x", &handle), ids(&["c1"]));

        registry.remove("x", "c1").await.unwrap();
        registry.remove("x", "c1").await.unwrap();
        assert_eq!(record_count(&registry, "x"), 0);
    }

    #[tokio::test]
    async fn test_failed_close_keeps_connector_attached() {
        let registry = ConnectionRegistry::new();
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser::default());
        closer.fail_next.store(true, Ordering::SeqCst);

        let handle = registry.create("c1", descriptor("modbus", json!({ "port": 502 }), false, &factory, &closer));
        handle.get_session().await.unwrap();

        let err = registry.remove("modbus", "c1").await.unwrap_err();
        assert!(err.is_teardown_failure());
        assert_eq!(reliant_of(&registry, "modbus", &handle), ids(&["c1"]));
        assert!(handle.is_connected().await);

        // A later remove retries the teardown
        registry.remove("modbus", "c1").await.unwrap();
        assert_eq!(closer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(record_count(&registry, "modbus"), 0);
    }

    #[tokio::test]
    async fn test_connector_attaching_during_close_keeps_record() {
        let release = Arc::new(Notify::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser {
            release: Some(release.clone()),
            ..Default::default()
        });

        let handle = registry.create("south-a", descriptor("opcua", json!({ "url": "u" }), true, &factory, &closer));
        handle.get_session().await.unwrap();

        let removal = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.remove("opcua", "south-a").await })
        };
        while closer.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let joined = registry.create("south-b", descriptor("opcua", json!({ "url": "u" }), true, &factory, &closer));
        assert!(Arc::ptr_eq(&handle, &joined));

        release.notify_one();
        removal.await.unwrap().unwrap();

        assert_eq!(record_count(&registry, "opcua"), 1);
        assert_eq!(reliant_of(&registry, "opcua", &handle), ids(&["south-b"]));

        // The surviving record lazily opens a fresh session
        assert_eq!(*joined.get_session().await.unwrap(), TestSession(2));
    }

    #[tokio::test]
    async fn test_cancelled_remove_keeps_connector_attached() {
        let release = Arc::new(Notify::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser {
            release: Some(release.clone()),
            ..Default::default()
        });

        let handle = registry.create("c1", descriptor("x", json!({ "host": "a" }), false, &factory, &closer));
        handle.get_session().await.unwrap();

        let removal = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.remove("x", "c1").await })
        };
        while closer.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        removal.abort();
        assert!(removal.await.unwrap_err().is_cancelled());

        assert_eq!(record_count(&registry, "x"), 1);
        assert_eq!(reliant_of(&registry, "x", &handle), ids(&["c1"]));
        assert!(handle.is_connected().await);

        // The next remove by the same connector finishes the teardown
        release.notify_one();
        registry.remove("x", "c1").await.unwrap();
        assert_eq!(closer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(record_count(&registry, "x"), 0);
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn test_remove_detaches_every_record_of_connector() {
        let release = Arc::new(Notify::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let factory = Arc::new(TestFactory::default());
        let closer = Arc::new(TestCloser {
            release: Some(release.clone()),
            ..Default::default()
        });
        closer.fail_next.store(true, Ordering::SeqCst);

        let old = registry.create("c1", descriptor("x", json!({ "host": "a" }), false, &factory, &closer));
        old.get_session().await.unwrap();

        let removal = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.remove("x", "c1").await })
        };
        while closer.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // Restarting connector gets a fresh record while the old one closes
        let new = registry.create("c1", descriptor("x", json!({ "host": "a" }), false, &factory, &closer));
        assert!(!Arc::ptr_eq(&old, &new));

        release.notify_one();
        assert!(removal.await.unwrap().unwrap_err().is_teardown_failure());
        assert_eq!(reliant_of(&registry, "x", &old), ids(&["c1"]));
        assert_eq!(reliant_of(&registry, "x", &new), ids(&["c1"]));

        release.notify_one();
        registry.remove("x", "c1").await.unwrap();
        assert_eq!(record_count(&registry, "x"), 0);
        assert!(!old.is_connected().await);
        assert_eq!(closer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_registry_timeouts_reach_sessions() {
        let registry: ConnectionRegistry<TestSession> = ConnectionRegistry::with_timeouts(OperationTimeouts {
            create: Some(std::time::Duration::from_millis(10)),
            close: None,
        });
        let factory = Arc::new(TestFactory {
            release: Some(Arc::new(Notify::new())),
            ..Default::default()
        });
        let closer = Arc::new(TestCloser::default());

        let handle = registry.create("c1", descriptor("x", json!({}), false, &factory, &closer));
        let err = handle.get_session().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }));
    }
}
