//! Configuration handling for the gateway.
//!
//! The configuration is read from a YAML file, then environment variables
//! override individual values. Command-line flags are applied last by the
//! binary itself, which also owns the log level.

use anyhow::{Context, Result};
use gateway_connection::OperationTimeouts;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Managed connection deadlines
    pub connection: ConnectionConfig,
    /// Connectors to start
    pub connectors: Vec<ConnectorConfig>,
}

/// Managed connection deadlines, in milliseconds (absent = unbounded)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Deadline for opening a session
    pub create_timeout_ms: Option<u64>,
    /// Deadline for closing a session
    pub close_timeout_ms: Option<u64>,
}

/// A connector and the connection it needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector id
    pub id: String,
    /// Connection type (connector family)
    #[serde(rename = "type")]
    pub connection_type: String,
    /// Whether connectors with identical settings may share the session
    #[serde(default)]
    pub shared: bool,
    /// How often the connector asks for its session
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Family-specific connection settings
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl ConnectionConfig {
    /// Deadlines handed to the connection registry
    pub fn timeouts(&self) -> OperationTimeouts {
        OperationTimeouts {
            create: self.create_timeout_ms.map(Duration::from_millis),
            close: self.close_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Replace the configured deadlines with command-line values
    pub fn override_timeouts(&mut self, create: Option<Duration>, close: Option<Duration>) -> Result<()> {
        if let Some(timeout) = create {
            self.create_timeout_ms = Some(to_millis(timeout).context("invalid create timeout")?);
        }
        if let Some(timeout) = close {
            self.close_timeout_ms = Some(to_millis(timeout).context("invalid close timeout")?);
        }
        Ok(())
    }
}

fn to_millis(duration: Duration) -> Result<u64> {
    u64::try_from(duration.as_millis())
        .with_context(|| format!("{:?} does not fit in milliseconds", duration))
}

impl GatewayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<GatewayConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        info!(
            "Final gateway configuration: connectors={}, create_timeout_ms={:?}, close_timeout_ms={:?}",
            config.connectors.len(),
            config.connection.create_timeout_ms,
            config.connection.close_timeout_ms
        );

        Ok(config)
    }

    /// Reject configurations the gateway cannot run
    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for connector in &self.connectors {
            if connector.id.is_empty() {
                anyhow::bail!("connector with empty id");
            }
            if !seen.insert(connector.id.as_str()) {
                anyhow::bail!("duplicate connector id {}", connector.id);
            }
            if connector.poll_interval_ms == 0 {
                anyhow::bail!("connector {} has a zero poll interval", connector.id);
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("GATEWAY_CREATE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.connection.create_timeout_ms = Some(ms);
                info!("Create timeout overridden by environment: {}ms", ms);
            }
        }

        if let Ok(timeout) = std::env::var("GATEWAY_CLOSE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.connection.close_timeout_ms = Some(ms);
                info!("Close timeout overridden by environment: {}ms", ms);
            }
        }
    }
}
