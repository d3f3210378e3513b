//! Managed session: lazy single-flight creation and guarded teardown.
//!
//! A [`ManagedSession`] owns at most one live session handle. The handle moves
//! through two states only:
//!
//! ```text
//! ABSENT --(factory success)--> PRESENT --(close success)--> ABSENT
//! ABSENT --(factory failure)--> ABSENT
//! PRESENT --(close failure)---> PRESENT
//! ```
//!
//! Each forward edge is guarded by its own [`CompletionGate`]. A caller that
//! finds a gate in flight waits for it and then re-checks the state; it never
//! assumes the other caller's attempt satisfied its own request.

use crate::descriptor::{SessionCloser, SessionFactory};
use crate::error::{ConnectionError, Operation};
use crate::gate::{CompletionGate, GateSignal};
use crate::types::{ConnectionType, ReliantConnectors};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Optional deadlines for factory and close invocations.
///
/// `None` waits indefinitely: a hung factory or close call then blocks every
/// other caller of the same managed session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationTimeouts {
    /// Deadline for the session factory
    pub create: Option<Duration>,
    /// Deadline for the close capability
    pub close: Option<Duration>,
}

struct SessionState<S> {
    session: Option<Arc<S>>,
    creation_gate: Option<GateSignal>,
    close_gate: Option<GateSignal>,
}

impl<S> SessionState<S> {
    fn pending_creation(&self) -> Option<GateSignal> {
        self.creation_gate.as_ref().filter(|gate| gate.is_pending()).cloned()
    }

    fn pending_close(&self) -> Option<GateSignal> {
        self.close_gate.as_ref().filter(|gate| gate.is_pending()).cloned()
    }
}

/// A lazily created, safely closed session shared through a registry record
pub struct ManagedSession<S> {
    id: u64,
    connection_type: ConnectionType,
    factory: Arc<dyn SessionFactory<S>>,
    closer: Arc<dyn SessionCloser<S>>,
    /// Same set instance as the owning registry record
    reliant: ReliantConnectors,
    timeouts: OperationTimeouts,
    state: Mutex<SessionState<S>>,
}

impl<S> ManagedSession<S>
where
    S: Send + Sync + 'static,
{
    /// Create a managed session with no live handle yet
    pub fn new(
        connection_type: ConnectionType,
        factory: Arc<dyn SessionFactory<S>>,
        closer: Arc<dyn SessionCloser<S>>,
        reliant: ReliantConnectors,
        timeouts: OperationTimeouts,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            connection_type,
            factory,
            closer,
            reliant,
            timeouts,
            state: Mutex::new(SessionState {
                session: None,
                creation_gate: None,
                close_gate: None,
            }),
        }
    }

    /// Process-unique id, used to tell managed sessions apart in logs
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Connector family this session belongs to
    pub fn connection_type(&self) -> &ConnectionType {
        &self.connection_type
    }

    /// Whether a live session is currently held
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    /// Return the live session, creating it if needed.
    ///
    /// Concurrent callers share a single factory invocation. If that
    /// invocation fails, only the caller that started it sees the error; the
    /// callers that were waiting start a fresh attempt.
    pub async fn get_session(&self) -> Result<Arc<S>, ConnectionError> {
        let gate = loop {
            let mut state = self.state.lock().await;
            if let Some(session) = &state.session {
                return Ok(session.clone());
            }

            match state.pending_creation() {
                Some(signal) => {
                    drop(state);
                    trace!(
                        connection_type = %self.connection_type,
                        session = self.id,
                        "Waiting for in-flight session creation"
                    );
                    signal.wait().await;
                }
                None => {
                    let (gate, signal) = CompletionGate::open();
                    state.creation_gate = Some(signal);
                    break gate;
                }
            }
        };

        debug!(
            connection_type = %self.connection_type,
            session = self.id,
            "Creating session"
        );
        let result = match with_deadline(
            Operation::Create,
            self.timeouts.create,
            self.factory.create_session(),
        )
        .await
        {
            Ok(Ok(Some(session))) => Ok(Arc::new(session)),
            Ok(Ok(None)) => Err(ConnectionError::NoSession),
            Ok(Err(e)) => Err(ConnectionError::Create(e)),
            Err(e) => Err(e),
        };

        let mut state = self.state.lock().await;
        state.creation_gate = None;
        match &result {
            Ok(session) => {
                state.session = Some(session.clone());
                debug!(
                    connection_type = %self.connection_type,
                    session = self.id,
                    "Session created"
                );
            }
            Err(e) => {
                error!(
                    connection_type = %self.connection_type,
                    session = self.id,
                    "Failed to create session: {}", e
                );
            }
        }
        drop(state);
        gate.complete();

        result
    }

    /// Close the live session if no connector relies on it anymore.
    ///
    /// This is a no-op when there is no session or when the reliant set is
    /// not empty. On failure the session is kept and the error returned.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let (gate, session) = loop {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.clone() else {
                trace!(
                    connection_type = %self.connection_type,
                    session = self.id,
                    "No session to close"
                );
                return Ok(());
            };

            if !self.reliant.is_empty() {
                trace!(
                    connection_type = %self.connection_type,
                    session = self.id,
                    "Session still used by {} connector(s), not closing",
                    self.reliant.len()
                );
                return Ok(());
            }

            match state.pending_close() {
                Some(signal) => {
                    drop(state);
                    trace!(
                        connection_type = %self.connection_type,
                        session = self.id,
                        "Waiting for in-flight session close"
                    );
                    signal.wait().await;
                }
                None => {
                    let (gate, signal) = CompletionGate::open();
                    state.close_gate = Some(signal);
                    break (gate, session);
                }
            }
        };

        debug!(
            connection_type = %self.connection_type,
            session = self.id,
            "Closing session"
        );
        let result = match with_deadline(
            Operation::Close,
            self.timeouts.close,
            self.closer.close_session(session),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Close(e)),
            Err(e) => Err(e),
        };

        let mut state = self.state.lock().await;
        state.close_gate = None;
        match &result {
            Ok(()) => {
                state.session = None;
                debug!(
                    connection_type = %self.connection_type,
                    session = self.id,
                    "Session closed"
                );
            }
            Err(e) => {
                error!(
                    connection_type = %self.connection_type,
                    session = self.id,
                    "Failed to close session: {}", e
                );
            }
        }
        drop(state);
        gate.complete();

        result
    }
}

impl<S> fmt::Debug for ManagedSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSession")
            .field("id", &self.id)
            .field("connection_type", &self.connection_type)
            .field("reliant", &self.reliant.len())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

async fn with_deadline<T>(
    operation: Operation,
    timeout: Option<Duration>,
    future: impl Future<Output = T>,
) -> Result<T, ConnectionError> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| ConnectionError::Timeout { operation, timeout }),
        None => Ok(future.await),
    }
}
