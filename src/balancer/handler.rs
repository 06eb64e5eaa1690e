//! Capabilities a control protocol provides to the balancer.

use crate::balancer::{BackendServer, BalancingSession, CircuitBreaker};
use crate::health::FaultDetector;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Admission request for one client.
#[derive(Debug)]
pub struct SessionParameter {
    client: String,
    downstream: Option<TcpStream>,
}

impl SessionParameter {
    /// A request identified only by the client id.
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            downstream: None,
        }
    }

    /// A request carrying the accepted client connection.
    pub fn with_downstream(client: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            client: client.into(),
            downstream: Some(stream),
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    /// Take ownership of the client connection. Yields it once.
    pub fn take_downstream(&mut self) -> Option<TcpStream> {
        self.downstream.take()
    }
}

/// Per-protocol factory for backend clients and session handlers.
#[async_trait]
pub trait BalancingPluginHandler: Send + Sync {
    /// Protocol name used in logs and errors.
    fn protocol(&self) -> &str;

    /// Create the circuit breaker for a backend monitored by `detector`.
    ///
    /// The returned breaker is not yet bound to an address.
    async fn new_client(&self, detector: Arc<dyn FaultDetector>) -> anyhow::Result<CircuitBreaker>;

    /// Open the protocol session towards the session's primary backend.
    async fn new_session(
        &self,
        session: &Arc<BalancingSession>,
        param: &mut SessionParameter,
    ) -> anyhow::Result<Box<dyn BalancingSessionHandler>>;
}

/// Protocol operations on one live session.
#[async_trait]
pub trait BalancingSessionHandler: Send + Sync {
    /// Tear down the remote side and wait for it.
    async fn stop_remote(&self) -> anyhow::Result<()>;

    /// Tear down the remote side without waiting.
    fn background_stop_remote(&self);

    /// Move the stream to `server`.
    async fn redirect_stream(&self, server: SocketAddr) -> anyhow::Result<()>;

    /// Choose a replacement for the session's failed primary.
    async fn handle_server_fault(
        &self,
        session: &BalancingSession,
    ) -> anyhow::Result<Arc<BackendServer>>;
}
