//! The backend pool for one protocol and session admission.
//!
//! Health flips reach the plugin through an observer on every backend's
//! breaker. The observer forwards them to the plugin's event loop, which
//! spawns one failover task per session whose primary went down.

use crate::balancer::selection::{self, sort_by_load};
use crate::balancer::{
    BackendServer, BalancerError, BalancingPluginHandler, BalancingSession, FailoverOutcome,
    MultiError, ServerHandle, SessionParameter, StateChange,
};
use crate::config::BalancingConfig;
use crate::health::{FaultDetectorFactory, Health};
use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use parking_lot::RwLock;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Observer a caller may attach to a backend when registering it.
pub type StateCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct PluginEvent {
    server: Weak<BackendServer>,
    change: StateChange,
}

/// Pool of backend servers for one protocol.
pub struct BalancingPlugin {
    host: ServerHandle,
    handler: Arc<dyn BalancingPluginHandler>,
    detectors: Arc<dyn FaultDetectorFactory>,
    config: BalancingConfig,
    metrics: MetricsCollector,
    servers: RwLock<Vec<Arc<BackendServer>>>,
    events: mpsc::UnboundedSender<PluginEvent>,
    shutdown: ShutdownSignal,
    stopped: AtomicBool,
}

impl BalancingPlugin {
    /// Create a plugin owned by the plugin server behind `host`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        host: ServerHandle,
        handler: Arc<dyn BalancingPluginHandler>,
        detectors: Arc<dyn FaultDetectorFactory>,
        config: BalancingConfig,
        metrics: MetricsCollector,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let shutdown = ShutdownSignal::new();
        let plugin = Arc::new(Self {
            host,
            handler,
            detectors,
            config,
            metrics,
            servers: RwLock::new(Vec::new()),
            events,
            shutdown: shutdown.clone(),
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(run(Arc::downgrade(&plugin), rx, shutdown.subscribe()));
        plugin
    }

    pub fn protocol(&self) -> &str {
        self.handler.protocol()
    }

    pub fn config(&self) -> &BalancingConfig {
        &self.config
    }

    pub fn host(&self) -> &ServerHandle {
        &self.host
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Backends in pool order, least loaded first.
    pub fn backend_servers(&self) -> Vec<Arc<BackendServer>> {
        self.servers.read().clone()
    }

    pub fn backend_server(&self, addr: SocketAddr) -> Option<Arc<BackendServer>> {
        self.servers.read().iter().find(|s| s.addr() == addr).cloned()
    }

    /// Resolve `addr`, build its monitored client and add it to the pool.
    ///
    /// On failure the pool is unchanged and everything created along the way
    /// is closed.
    pub async fn add_backend_server(
        self: &Arc<Self>,
        addr: &str,
        callback: Option<StateCallback>,
    ) -> Result<Arc<BackendServer>, BalancerError> {
        let resolved = resolve(addr).await?;
        if self.backend_server(resolved).is_some() {
            return Err(BalancerError::DuplicateServer(resolved));
        }

        let detector = self
            .detectors
            .create(resolved)
            .map_err(|source| BalancerError::Detector {
                addr: resolved,
                source,
            })?;

        let breaker = match self.handler.new_client(Arc::clone(&detector)).await {
            Ok(breaker) => breaker,
            Err(reason) => {
                if let Err(e) = detector.close().await {
                    warn!(server = %resolved, error = %e, "failed to close detector");
                }
                return Err(BalancerError::Client {
                    protocol: self.protocol().to_string(),
                    addr: resolved,
                    reason,
                });
            }
        };

        if let Err(e) = breaker.set_server(resolved) {
            discard(&breaker).await;
            return Err(e);
        }

        let server = Arc::new(BackendServer::new(resolved, breaker));
        if let Some(callback) = callback {
            server
                .breaker()
                .add_state_changed_callback(move |change| callback(change));
        }
        let events = self.events.clone();
        let observed = Arc::downgrade(&server);
        server.breaker().add_state_changed_callback(move |change| {
            let _ = events.send(PluginEvent {
                server: observed.clone(),
                change: change.clone(),
            });
        });

        if let Err(e) = server.breaker().start() {
            discard(server.breaker()).await;
            return Err(e);
        }

        let duplicate = {
            let mut servers = self.servers.write();
            if servers.iter().any(|s| s.addr() == resolved) {
                true
            } else {
                servers.push(Arc::clone(&server));
                sort_by_load(&mut servers, self.config.backup_session_weight);
                false
            }
        };
        if duplicate {
            discard(server.breaker()).await;
            return Err(BalancerError::DuplicateServer(resolved));
        }

        self.metrics
            .set_backend_health(self.protocol(), resolved, server.health());
        info!(protocol = %self.protocol(), server = %resolved, "backend server registered");
        Ok(server)
    }

    /// Admit a client: pick servers, open the protocol session and register.
    pub async fn new_session(
        self: &Arc<Self>,
        param: &mut SessionParameter,
    ) -> Result<Arc<BalancingSession>, BalancerError> {
        let picked = {
            let servers = self.servers.read();
            selection::pick(
                &servers,
                self.config.num_backup_servers,
                self.config.backup_session_weight,
            )
        };
        let Some(picked) = picked else {
            self.metrics.record_admission(self.protocol(), false);
            warn!(protocol = %self.protocol(), client = %param.client(), "no backend server available");
            return Err(BalancerError::NoServerAvailable {
                protocol: self.protocol().to_string(),
            });
        };

        let session = BalancingSession::new(Arc::clone(self), param.client().to_string(), picked);
        let handler = match self.handler.new_session(&session, param).await {
            Ok(handler) => handler,
            Err(reason) => {
                self.metrics.record_admission(self.protocol(), false);
                warn!(
                    protocol = %self.protocol(),
                    client = %param.client(),
                    error = %format!("{reason:#}"),
                    "session creation failed"
                );
                return Err(BalancerError::SessionCreation {
                    protocol: self.protocol().to_string(),
                    reason,
                });
            }
        };
        session.attach_handler(handler);
        session.register();
        self.resort();
        self.metrics.record_admission(self.protocol(), true);

        let primary = session.primary();
        info!(
            protocol = %self.protocol(),
            client = %session.client(),
            primary = %primary,
            backups = session.backups().len(),
            "session admitted"
        );

        // The primary may have failed between selection and registration.
        if !primary.is_up() {
            self.spawn_failover(Arc::clone(&session), primary);
        }
        Ok(session)
    }

    /// Least loaded healthy backend not in `exclude`.
    pub fn pick_replacement(&self, exclude: &[SocketAddr]) -> Option<Arc<BackendServer>> {
        let servers = self.servers.read();
        selection::pick_replacement(&servers, exclude, self.config.backup_session_weight)
    }

    /// Re-sort the pool after a load change and publish the loads.
    pub fn resort(&self) {
        let mut servers = self.servers.write();
        sort_by_load(&mut servers, self.config.backup_session_weight);
        for server in servers.iter() {
            self.metrics
                .set_backend_sessions(self.protocol(), server.addr(), server.load());
        }
    }

    /// Close every backend's breaker, collecting all failures.
    pub async fn stop(&self) -> Result<(), MultiError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let servers = self.backend_servers();
        let mut errors = MultiError::new();
        for server in servers {
            if let Err(e) = server.breaker().close().await {
                error!(protocol = %self.protocol(), server = %server, error = %e, "failed to close backend connection");
                errors.push(e);
            }
        }
        self.shutdown.shutdown();
        info!(protocol = %self.protocol(), "balancing plugin stopped");
        errors.into_result()
    }

    fn server_state_changed(self: &Arc<Self>, server: Arc<BackendServer>, change: StateChange) {
        self.metrics
            .record_health_transition(self.protocol(), server.addr(), change.health);

        if change.health == Health::Up {
            debug!(protocol = %self.protocol(), server = %server, "backend available again");
            return;
        }

        let sessions = server.primary_sessions();
        if !sessions.is_empty() {
            info!(
                protocol = %self.protocol(),
                server = %server,
                sessions = sessions.len(),
                "failing over sessions of down backend"
            );
        }
        for session in sessions {
            self.spawn_failover(session, Arc::clone(&server));
        }
    }

    fn spawn_failover(&self, session: Arc<BalancingSession>, failed: Arc<BackendServer>) {
        tokio::spawn(async move {
            if let FailoverOutcome::Terminated(_) = session.fail_over(&failed).await {
                if !session.stop_containing_session() {
                    warn!(client = %session.client(), "plugin server gone, cleaning up session");
                    session.cleanup_in_background();
                }
            }
        });
    }
}

impl fmt::Debug for BalancingPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancingPlugin")
            .field("protocol", &self.protocol())
            .field("config", &self.config)
            .field("servers", &self.servers.read().len())
            .finish()
    }
}

async fn run(
    plugin: Weak<BalancingPlugin>,
    mut events: mpsc::UnboundedReceiver<PluginEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(plugin) = plugin.upgrade() else { break };
                let Some(server) = event.server.upgrade() else { continue };
                plugin.server_state_changed(server, event.change);
            }
        }
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, BalancerError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|source| BalancerError::Resolve {
            addr: addr.to_string(),
            source,
        })?;
    addrs
        .next()
        .ok_or_else(|| BalancerError::NoAddress(addr.to_string()))
}

async fn discard(breaker: &crate::balancer::CircuitBreaker) {
    if let Err(e) = breaker.close().await {
        warn!(error = %e, "failed to close discarded backend connection");
    }
}
