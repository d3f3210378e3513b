//! Connector-side view of a managed connection.

use crate::descriptor::ConnectionDescriptor;
use crate::error::ConnectionError;
use crate::registry::ConnectionRegistry;
use crate::session::ManagedSession;
use crate::types::{ConnectionType, ConnectorId};
use std::sync::Arc;

/// A connector's attachment to a managed connection.
///
/// Acquiring a lease registers the connector with the registry; releasing it
/// detaches the connector and, if it was the last one, closes the session.
/// Dropping a lease does not release it: teardown is async and may fail, so
/// connectors release explicitly when they stop.
#[derive(Debug)]
pub struct ConnectionLease<S> {
    registry: Arc<ConnectionRegistry<S>>,
    connector_id: ConnectorId,
    connection_type: ConnectionType,
    handle: Arc<ManagedSession<S>>,
}

impl<S> ConnectionLease<S>
where
    S: Send + Sync + 'static,
{
    /// Attach `connector_id` to the connection described by `descriptor`
    pub fn acquire(
        registry: Arc<ConnectionRegistry<S>>,
        connector_id: impl Into<ConnectorId>,
        descriptor: ConnectionDescriptor<S>,
    ) -> Self {
        let connector_id = connector_id.into();
        let connection_type = descriptor.connection_type.clone();
        let handle = registry.create(connector_id.clone(), descriptor);
        Self {
            registry,
            connector_id,
            connection_type,
            handle,
        }
    }

    /// Live session, created on first use
    pub async fn session(&self) -> Result<Arc<S>, ConnectionError> {
        self.handle.get_session().await
    }

    /// Managed session backing this lease
    pub fn handle(&self) -> &Arc<ManagedSession<S>> {
        &self.handle
    }

    /// Connector holding the lease
    pub fn connector_id(&self) -> &ConnectorId {
        &self.connector_id
    }

    /// Detach the connector; safe to call more than once
    pub async fn release(&self) -> Result<(), ConnectionError> {
        self.registry
            .remove(&self.connection_type.0, &self.connector_id.0)
            .await
    }
}
