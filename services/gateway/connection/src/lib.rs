//! Managed connections for gateway connectors.
//!
//! South and north connectors need live sessions to external systems
//! (OPC UA servers, brokers, databases). This crate owns the lifecycle of
//! those sessions so that:
//!
//! - a session is created at most once per managed connection, lazily, no
//!   matter how many callers ask for it concurrently,
//! - connectors with structurally identical settings can transparently
//!   share one session when they opt in,
//! - a session is torn down at most once, and never while a connector
//!   still relies on it.
//!
//! The protocol-specific work stays with the connector: it supplies a
//! [`SessionFactory`] and a [`SessionCloser`] and this crate decides when
//! to call them. Health checking, reconnection and backoff are left to the
//! connector as well.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateway_connection::{ConnectionDescriptor, ConnectionRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry: ConnectionRegistry<String> = ConnectionRegistry::new();
//!
//! let descriptor = ConnectionDescriptor::new(
//!     "opcua",
//!     &serde_json::json!({ "url": "opc.tcp://plc:4840" }),
//!     || async { Ok::<_, anyhow::Error>(Some("session".to_string())) },
//!     |_session: Arc<String>| async { Ok::<_, anyhow::Error>(()) },
//! )?
//! .shared(true);
//!
//! let handle = registry.create("south-1", descriptor);
//! let session = handle.get_session().await?;
//! println!("connected: {}", session);
//!
//! registry.remove("opcua", "south-1").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod descriptor;
pub mod error;
pub mod gate;
pub mod lease;
pub mod registry;
pub mod session;
pub mod types;

// Re-export main types
pub use descriptor::{Closable, CloseSession, ConnectionDescriptor, SessionCloser, SessionFactory};
pub use error::{ConnectionError, Operation};
pub use gate::{CompletionGate, GateSignal};
pub use lease::ConnectionLease;
pub use registry::ConnectionRegistry;
pub use session::{ManagedSession, OperationTimeouts};
pub use types::{ConnectionSettings, ConnectionType, ConnectorId, ReliantConnectors};
