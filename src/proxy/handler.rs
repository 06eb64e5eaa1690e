//! Balancing handler for plain TCP control streams.
//!
//! Each admitted client connection is relayed to the session's primary.
//! Failover redirects the relay to the replacement backend.

use crate::balancer::{
    BackendServer, BalancingPluginHandler, BalancingSession, BalancingSessionHandler,
    CircuitBreaker, SessionParameter,
};
use crate::health::FaultDetector;
use crate::metrics::MetricsCollector;
use crate::proxy::tcp_proxy::{Redirect, RelayEnd, TcpProxyError, connect_to_backend, relay};
use crate::util::ShutdownSignal;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Plugin handler relaying client TCP streams to backends.
pub struct StreamPluginHandler {
    protocol: String,
    frontend: String,
    connect_timeout: Duration,
    metrics: MetricsCollector,
}

impl StreamPluginHandler {
    pub fn new(
        protocol: impl Into<String>,
        frontend: impl Into<String>,
        connect_timeout: Duration,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            frontend: frontend.into(),
            connect_timeout,
            metrics,
        }
    }
}

#[async_trait]
impl BalancingPluginHandler for StreamPluginHandler {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn new_client(&self, detector: Arc<dyn FaultDetector>) -> anyhow::Result<CircuitBreaker> {
        Ok(CircuitBreaker::new(self.protocol.clone(), detector))
    }

    async fn new_session(
        &self,
        session: &Arc<BalancingSession>,
        param: &mut SessionParameter,
    ) -> anyhow::Result<Box<dyn BalancingSessionHandler>> {
        let client = param
            .take_downstream()
            .ok_or_else(|| anyhow!("client {} has no stream to relay", param.client()))?;
        let primary = session.primary().addr();
        let backend = connect_to_backend(primary, self.connect_timeout)
            .await
            .with_context(|| format!("failed to open stream to {primary}"))?;

        let (redirects, redirect_rx) = mpsc::unbounded_channel();
        let stop = ShutdownSignal::new();
        let relay = relay(
            client,
            backend,
            redirect_rx,
            stop.subscribe(),
            self.connect_timeout,
        );

        let weak = Arc::downgrade(session);
        let frontend = self.frontend.clone();
        let metrics = self.metrics.clone();
        // The relay task owns the connection gauge from here on.
        metrics.connection_opened(&frontend);
        let task = tokio::spawn(async move {
            let stats = relay.await;
            metrics.record_relayed(&frontend, stats.upstream, stats.downstream);
            metrics.connection_closed(&frontend);
            let Some(session) = weak.upgrade() else {
                return;
            };
            info!(
                client = %session.client(),
                upstream = stats.upstream,
                downstream = stats.downstream,
                redirects = stats.redirects,
                end = ?stats.end,
                "relay finished"
            );
            if stats.end != RelayEnd::Stopped {
                session.stop_containing_session();
            }
        });

        debug!(client = %session.client(), backend = %primary, "relay started");
        Ok(Box::new(StreamSessionHandler {
            redirects,
            stop,
            task: Mutex::new(Some(task)),
        }))
    }
}

/// Live relay of one client.
pub struct StreamSessionHandler {
    redirects: mpsc::UnboundedSender<Redirect>,
    stop: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BalancingSessionHandler for StreamSessionHandler {
    async fn stop_remote(&self) -> anyhow::Result<()> {
        self.stop.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("relay task failed")?;
        }
        Ok(())
    }

    fn background_stop_remote(&self) {
        self.stop.shutdown();
    }

    async fn redirect_stream(&self, server: SocketAddr) -> anyhow::Result<()> {
        let (done, result) = oneshot::channel();
        self.redirects
            .send(Redirect {
                target: server,
                done,
            })
            .map_err(|_| TcpProxyError::RelayEnded)?;
        result
            .await
            .map_err(|_| TcpProxyError::RelayEnded)?
            .with_context(|| format!("failed to redirect stream to {server}"))
    }

    async fn handle_server_fault(
        &self,
        session: &BalancingSession,
    ) -> anyhow::Result<Arc<BackendServer>> {
        session
            .next_backup_server()
            .ok_or_else(|| anyhow!("no healthy server to take over from {}", session.primary()))
    }
}
