//! Connection descriptors and the capabilities connectors plug into them.

use crate::error::ConnectionError;
use crate::types::{ConnectionSettings, ConnectionType};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Opens a new session to the external system.
///
/// Returning `Ok(None)` means the connector could not produce a session
/// without a more specific error; it is reported as
/// [`ConnectionError::NoSession`].
#[async_trait]
pub trait SessionFactory<S>: Send + Sync {
    /// Create a session
    async fn create_session(&self) -> anyhow::Result<Option<S>>;
}

#[async_trait]
impl<S, F, Fut> SessionFactory<S> for F
where
    S: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<S>>> + Send + 'static,
{
    async fn create_session(&self) -> anyhow::Result<Option<S>> {
        (self)().await
    }
}

/// Tears down a session previously produced by a [`SessionFactory`]
#[async_trait]
pub trait SessionCloser<S>: Send + Sync {
    /// Close the session
    async fn close_session(&self, session: Arc<S>) -> anyhow::Result<()>;
}

#[async_trait]
impl<S, F, Fut> SessionCloser<S> for F
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn close_session(&self, session: Arc<S>) -> anyhow::Result<()> {
        (self)(session).await
    }
}

/// Session types that know how to close themselves
#[async_trait]
pub trait Closable: Send + Sync {
    /// Close the underlying connection
    async fn close(&self) -> anyhow::Result<()>;
}

/// [`SessionCloser`] that delegates to [`Closable::close`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseSession;

#[async_trait]
impl<S> SessionCloser<S> for CloseSession
where
    S: Closable + 'static,
{
    async fn close_session(&self, session: Arc<S>) -> anyhow::Result<()> {
        session.close().await
    }
}

/// Everything a connector supplies when it asks for a managed connection
pub struct ConnectionDescriptor<S> {
    /// Connector family, used as the registry index key
    pub connection_type: ConnectionType,
    /// Settings compared structurally to find reusable connections
    pub settings: ConnectionSettings,
    /// Creates the session on first use
    pub factory: Arc<dyn SessionFactory<S>>,
    /// Closes the session once no connector relies on it
    pub closer: Arc<dyn SessionCloser<S>>,
    /// Whether other connectors with the same settings may reuse the session
    pub shared: bool,
}

impl<S> ConnectionDescriptor<S> {
    /// Create an exclusive (non-shared) connection descriptor
    pub fn new<T, F, C>(
        connection_type: impl Into<ConnectionType>,
        settings: &T,
        factory: F,
        closer: C,
    ) -> Result<Self, ConnectionError>
    where
        T: Serialize + ?Sized,
        F: SessionFactory<S> + 'static,
        C: SessionCloser<S> + 'static,
    {
        Ok(Self {
            connection_type: connection_type.into(),
            settings: ConnectionSettings::from_serialize(settings)?,
            factory: Arc::new(factory),
            closer: Arc::new(closer),
            shared: false,
        })
    }

    /// Set whether the connection may be shared between connectors
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }
}

impl<S> fmt::Debug for ConnectionDescriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("connection_type", &self.connection_type)
            .field("settings", &self.settings)
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}
