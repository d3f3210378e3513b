//! TCP connector family.
//!
//! A `tcp` connector keeps a plain TCP session to `host:port` and asks for it
//! on every poll. The session is opened lazily through the managed
//! connection registry, shared when the connector opts in, and shut down when
//! the last connector using it stops.

use crate::config::ConnectorConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use gateway_connection::{
    Closable, CloseSession, ConnectionDescriptor, ConnectionLease, ConnectionRegistry,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Connection type served by this module
pub const TCP_CONNECTION_TYPE: &str = "tcp";

/// Settings of a `tcp` connector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpSettings {
    /// Remote host name or address
    pub host: String,
    /// Remote port
    pub port: u16,
}

/// Live TCP session
#[derive(Debug)]
pub struct TcpSession {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl TcpSession {
    /// Open a TCP session to the configured endpoint
    pub async fn connect(settings: &TcpSettings) -> Result<Self> {
        let stream = TcpStream::connect((settings.host.as_str(), settings.port))
            .await
            .with_context(|| format!("connecting to {}:{}", settings.host, settings.port))?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            peer,
            stream: Mutex::new(stream),
        })
    }

    /// Remote address of the session
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Closable for TcpSession {
    async fn close(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream.shutdown().await?;
        debug!("TCP session to {} shut down", self.peer);
        Ok(())
    }
}

/// Build the managed connection descriptor of a `tcp` connector
pub fn tcp_descriptor(settings: TcpSettings, shared: bool) -> Result<ConnectionDescriptor<TcpSession>> {
    let factory_settings = settings.clone();
    let descriptor: ConnectionDescriptor<TcpSession> = ConnectionDescriptor::new(
        TCP_CONNECTION_TYPE,
        &settings,
        move || {
            let settings = factory_settings.clone();
            async move { TcpSession::connect(&settings).await.map(Some) }
        },
        CloseSession,
    )?;
    Ok(descriptor.shared(shared))
}

/// A running connector holding its connection lease
pub struct Connector {
    config: ConnectorConfig,
    lease: ConnectionLease<TcpSession>,
}

impl Connector {
    /// Register the connector's connection with the registry
    pub fn start(registry: Arc<ConnectionRegistry<TcpSession>>, config: ConnectorConfig) -> Result<Self> {
        if config.connection_type != TCP_CONNECTION_TYPE {
            bail!(
                "connector {} has unsupported type {}",
                config.id,
                config.connection_type
            );
        }
        let settings: TcpSettings = serde_json::from_value(config.settings.clone())
            .with_context(|| format!("invalid settings for connector {}", config.id))?;

        info!(
            connection_type = TCP_CONNECTION_TYPE,
            connector_id = %config.id,
            "Starting connector for {}:{} (shared: {})",
            settings.host,
            settings.port,
            config.shared
        );
        let lease = ConnectionLease::acquire(registry, config.id.clone(), tcp_descriptor(settings, config.shared)?);

        Ok(Self { config, lease })
    }

    /// Connector id
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Poll the session until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));

        loop {
            tokio::select! {
                _ = interval.tick() => self.poll().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll(&self) {
        match self.lease.session().await {
            Ok(session) => debug!(
                connection_type = TCP_CONNECTION_TYPE,
                connector_id = %self.config.id,
                "Session to {} ready",
                session.peer()
            ),
            Err(e) if e.is_creation_failure() => warn!(
                connection_type = TCP_CONNECTION_TYPE,
                connector_id = %self.config.id,
                "Session unavailable, retrying on next poll: {}",
                e
            ),
            Err(e) => error!(
                connection_type = TCP_CONNECTION_TYPE,
                connector_id = %self.config.id,
                "Session lookup failed: {}",
                e
            ),
        }
    }

    /// Detach from the managed connection
    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.lease.release().await {
            if e.is_teardown_failure() {
                warn!(
                    connection_type = TCP_CONNECTION_TYPE,
                    connector_id = %self.config.id,
                    "Session still open, connector stays attached until stopped again"
                );
            }
            return Err(e).with_context(|| format!("stopping connector {}", self.config.id));
        }
        info!(
            connection_type = TCP_CONNECTION_TYPE,
            connector_id = %self.config.id,
            "Connector stopped"
        );
        Ok(())
    }
}
