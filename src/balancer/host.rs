//! Plugin server: the session registry in front of one or more plugins.
//!
//! A client session consists of one balancing session per plugin. The server
//! admits them together, tears them down together, and serves stop requests
//! raised by sessions themselves (failed failover, remote end closed).

use crate::balancer::{
    BalancerError, BalancingPlugin, BalancingSession, MultiError, SessionParameter,
};
use crate::util::ShutdownSignal;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Handle through which plugins and sessions reach their plugin server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    name: Arc<str>,
    stop_requests: mpsc::UnboundedSender<String>,
}

impl ServerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the server to stop `client`'s session on its own task.
    ///
    /// Returns `false` if the server is gone.
    pub fn request_stop(&self, client: &str) -> bool {
        self.stop_requests.send(client.to_string()).is_ok()
    }

    fn same_server(&self, other: &ServerHandle) -> bool {
        self.stop_requests.same_channel(&other.stop_requests)
    }
}

enum Slot {
    /// Admission in progress.
    Admitting,
    Active(Vec<Arc<BalancingSession>>),
}

struct Inner {
    name: String,
    plugins: RwLock<Vec<Arc<BalancingPlugin>>>,
    sessions: DashMap<String, Slot>,
    handle: ServerHandle,
    shutdown: ShutdownSignal,
}

/// Registry of client sessions across a set of balancing plugins.
#[derive(Clone)]
pub struct PluginServer {
    inner: Arc<Inner>,
}

impl PluginServer {
    /// Create a server and start serving stop requests.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = ShutdownSignal::new();
        let inner = Arc::new(Inner {
            handle: ServerHandle {
                name: Arc::from(name.as_str()),
                stop_requests: tx,
            },
            name,
            plugins: RwLock::new(Vec::new()),
            sessions: DashMap::new(),
            shutdown: shutdown.clone(),
        });
        tokio::spawn(serve_stop_requests(
            Arc::downgrade(&inner),
            rx,
            shutdown.subscribe(),
        ));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Handle required to construct plugins for this server.
    pub fn handle(&self) -> ServerHandle {
        self.inner.handle.clone()
    }

    /// Attach a plugin created with this server's handle.
    pub fn add_plugin(&self, plugin: Arc<BalancingPlugin>) -> Result<(), BalancerError> {
        if !plugin.host().same_server(&self.inner.handle) {
            return Err(BalancerError::ForeignPlugin {
                protocol: plugin.protocol().to_string(),
                server: self.inner.name.clone(),
            });
        }
        self.inner.plugins.write().push(plugin);
        Ok(())
    }

    pub fn plugins(&self) -> Vec<Arc<BalancingPlugin>> {
        self.inner.plugins.read().clone()
    }

    /// Admit a client through every plugin, in registration order.
    ///
    /// If any plugin rejects the client, the sessions already created are
    /// torn down in the background and the error is returned.
    pub async fn new_session(
        &self,
        mut param: SessionParameter,
    ) -> Result<Vec<Arc<BalancingSession>>, BalancerError> {
        if self.inner.shutdown.is_shutdown() {
            return Err(BalancerError::ServerStopped(self.inner.name.clone()));
        }
        let plugins = self.plugins();
        if plugins.is_empty() {
            return Err(BalancerError::NoPlugins(self.inner.name.clone()));
        }

        let client = param.client().to_string();
        match self.inner.sessions.entry(client.clone()) {
            Entry::Occupied(_) => return Err(BalancerError::DuplicateSession(client)),
            Entry::Vacant(entry) => {
                entry.insert(Slot::Admitting);
            }
        }

        let mut created = Vec::with_capacity(plugins.len());
        for plugin in &plugins {
            match plugin.new_session(&mut param).await {
                Ok(session) => created.push(session),
                Err(e) => {
                    self.inner.sessions.remove(&client);
                    for session in &created {
                        session.cleanup_in_background();
                    }
                    return Err(e);
                }
            }
        }

        let installed = match self.inner.sessions.get_mut(&client) {
            Some(mut slot) if matches!(*slot, Slot::Admitting) => {
                *slot = Slot::Active(created.clone());
                true
            }
            _ => false,
        };
        if !installed {
            for session in &created {
                session.cleanup_in_background();
            }
            return Err(BalancerError::StoppedDuringAdmission(client));
        }

        info!(server = %self.inner.name, client = %client, "session started");
        Ok(created)
    }

    /// Remove `client`'s session and clean up each plugin session.
    pub async fn stop_session(&self, client: &str) -> Result<(), MultiError> {
        let Some((_, slot)) = self.inner.sessions.remove(client) else {
            debug!(client = %client, "no session to stop");
            return Ok(());
        };
        let Slot::Active(sessions) = slot else {
            // The admitting task sees the removal and rolls back.
            return Ok(());
        };

        let mut errors = MultiError::new();
        for session in sessions {
            if let Err(e) = session.cleanup().await {
                errors.push(e);
            }
        }
        info!(server = %self.inner.name, client = %client, "session stopped");
        errors.into_result()
    }

    /// Clients with an active or admitting session.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// The plugin sessions of an active client.
    pub fn sessions(&self, client: &str) -> Option<Vec<Arc<BalancingSession>>> {
        self.inner.sessions.get(client).and_then(|slot| match &*slot {
            Slot::Active(sessions) => Some(sessions.clone()),
            Slot::Admitting => None,
        })
    }

    /// Stop every session, then every plugin. Collects all failures.
    pub async fn stop(&self) -> Result<(), MultiError> {
        if !self.inner.shutdown.shutdown() {
            return Ok(());
        }
        let clients: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut errors = MultiError::new();
        for client in clients {
            if let Err(e) = self.stop_session(&client).await {
                errors.extend(e);
            }
        }
        for plugin in self.plugins() {
            if let Err(e) = plugin.stop().await {
                errors.extend(e);
            }
        }
        info!(server = %self.inner.name, errors = errors.len(), "plugin server stopped");
        errors.into_result()
    }
}

async fn serve_stop_requests(
    inner: Weak<Inner>,
    mut requests: mpsc::UnboundedReceiver<String>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            request = requests.recv() => {
                let Some(client) = request else { break };
                let Some(inner) = inner.upgrade() else { break };
                let server = PluginServer { inner };
                tokio::spawn(async move {
                    if let Err(e) = server.stop_session(&client).await {
                        warn!(client = %client, error = %e, "errors while stopping session");
                    }
                });
            }
        }
    }
    debug!("stop request loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::testing::{FaultPolicy, Harness, MockPluginHandler, wait_for};
    use crate::config::BalancingConfig;
    use crate::health::ManualDetectorFactory;
    use crate::metrics::MetricsCollector;

    #[tokio::test]
    async fn test_duplicate_client_rejected() {
        let harness = Harness::new(&["127.0.0.1:5001"]).await;
        harness.admit("alice").await.unwrap();

        let err = harness.admit("alice").await.unwrap_err();
        assert!(matches!(err, BalancerError::DuplicateSession(c) if c == "alice"));
        assert_eq!(harness.host.session_count(), 1);
    }

    #[tokio::test]
    async fn test_no_plugins() {
        let host = PluginServer::new("empty");
        let err = host
            .new_session(SessionParameter::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::NoPlugins(_)));
    }

    #[tokio::test]
    async fn test_foreign_plugin_rejected() {
        let owner = PluginServer::new("owner");
        let other = PluginServer::new("other");
        let plugin = BalancingPlugin::new(
            owner.handle(),
            Arc::new(MockPluginHandler::new("mock")),
            Arc::new(ManualDetectorFactory::new()),
            BalancingConfig::default(),
            MetricsCollector::new(),
        );

        assert!(matches!(
            other.add_plugin(Arc::clone(&plugin)),
            Err(BalancerError::ForeignPlugin { .. })
        ));
        assert!(owner.add_plugin(plugin).is_ok());
    }

    #[tokio::test]
    async fn test_stop_session_cleans_up() {
        let harness = Harness::new(&["127.0.0.1:5011", "127.0.0.1:5012"]).await;
        let session = harness.admit("bob").await.unwrap();
        assert_eq!(harness.host.sessions("bob").unwrap().len(), 1);

        harness.host.stop_session("bob").await.unwrap();
        assert!(session.is_cleaned_up());
        assert_eq!(harness.host.session_count(), 0);
        assert_eq!(harness.handler.calls("bob").stop_remote, 1);
        assert!(harness.host.stop_session("bob").await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_request_tears_down_session() {
        let harness = Harness::new(&["127.0.0.1:5021"]).await;
        let session = harness.admit("carol").await.unwrap();

        assert!(session.stop_containing_session());
        wait_for(|| harness.host.session_count() == 0).await;
        wait_for(|| session.is_cleaned_up()).await;
        assert_eq!(harness.handler.calls("carol").stop_remote, 1);
    }

    #[tokio::test]
    async fn test_stop_reports_failed_failovers() {
        let harness = Harness::new(&["127.0.0.1:5031", "127.0.0.1:5032"]).await;
        harness.handler.set_fault_policy(FaultPolicy::Fail);
        let session = harness.admit("dave").await.unwrap();
        let failed = session.primary();

        // Fail over directly so the session stays registered.
        let _ = session.fail_over(&failed).await;
        let err = harness.host.stop().await.unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(matches!(err.errors()[0], BalancerError::Failover(_)));

        let err = harness
            .host
            .new_session(SessionParameter::new("erin"))
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::ServerStopped(_)));
        assert!(harness.host.stop().await.is_ok());
    }
}
