//! Test doubles for the balancer: a recording protocol handler, a detector
//! wrapper and a harness that wires a plugin server around them.

use crate::balancer::{
    BackendServer, BalancingPlugin, BalancingPluginHandler, BalancingSession,
    BalancingSessionHandler, BalancerError, CircuitBreaker, PluginServer, SessionParameter,
};
use crate::config::BalancingConfig;
use crate::health::{
    DetectorError, FaultDetector, FaultDetectorFactory, ManualDetector, ManualDetectorFactory,
    TransitionSender,
};
use crate::metrics::MetricsCollector;
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A backend with a manual detector, outside any pool.
pub(crate) fn backend(addr: &str) -> BackendServer {
    let addr: SocketAddr = addr.parse().unwrap();
    let breaker = CircuitBreaker::new("test", Arc::new(ManualDetector::new(addr)));
    breaker.set_server(addr).unwrap();
    BackendServer::new(addr, breaker)
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Calls a mock session handler received for one client.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallRecord {
    pub sessions: usize,
    pub stop_remote: usize,
    pub background_stop_remote: usize,
    pub redirects: Vec<SocketAddr>,
    pub faults: usize,
}

/// How the mock answers `handle_server_fault`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FaultPolicy {
    NextBackup,
    Fail,
}

struct MockState {
    calls: Mutex<HashMap<String, CallRecord>>,
    policy: Mutex<FaultPolicy>,
    fail_new_client: AtomicBool,
    fail_new_session: AtomicBool,
    fail_redirects: AtomicBool,
}

impl MockState {
    fn record(&self, client: &str, update: impl FnOnce(&mut CallRecord)) {
        update(self.calls.lock().entry(client.to_string()).or_default());
    }
}

pub(crate) struct MockPluginHandler {
    protocol: String,
    state: Arc<MockState>,
}

impl MockPluginHandler {
    pub(crate) fn new(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            state: Arc::new(MockState {
                calls: Mutex::new(HashMap::new()),
                policy: Mutex::new(FaultPolicy::NextBackup),
                fail_new_client: AtomicBool::new(false),
                fail_new_session: AtomicBool::new(false),
                fail_redirects: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn calls(&self, client: &str) -> CallRecord {
        self.state
            .calls
            .lock()
            .get(client)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn set_fault_policy(&self, policy: FaultPolicy) {
        *self.state.policy.lock() = policy;
    }

    pub(crate) fn fail_new_client(&self, fail: bool) {
        self.state.fail_new_client.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_new_session(&self, fail: bool) {
        self.state.fail_new_session.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_redirects(&self, fail: bool) {
        self.state.fail_redirects.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BalancingPluginHandler for MockPluginHandler {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn new_client(&self, detector: Arc<dyn FaultDetector>) -> anyhow::Result<CircuitBreaker> {
        if self.state.fail_new_client.load(Ordering::SeqCst) {
            return Err(anyhow!("client refused"));
        }
        Ok(CircuitBreaker::new(self.protocol.clone(), detector))
    }

    async fn new_session(
        &self,
        session: &Arc<BalancingSession>,
        _param: &mut SessionParameter,
    ) -> anyhow::Result<Box<dyn BalancingSessionHandler>> {
        if self.state.fail_new_session.load(Ordering::SeqCst) {
            return Err(anyhow!("session refused"));
        }
        self.state.record(session.client(), |c| c.sessions += 1);
        Ok(Box::new(MockSessionHandler {
            client: session.client().to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSessionHandler {
    client: String,
    state: Arc<MockState>,
}

#[async_trait]
impl BalancingSessionHandler for MockSessionHandler {
    async fn stop_remote(&self) -> anyhow::Result<()> {
        self.state.record(&self.client, |c| c.stop_remote += 1);
        Ok(())
    }

    fn background_stop_remote(&self) {
        self.state
            .record(&self.client, |c| c.background_stop_remote += 1);
    }

    async fn redirect_stream(&self, server: SocketAddr) -> anyhow::Result<()> {
        if self.state.fail_redirects.load(Ordering::SeqCst) {
            return Err(anyhow!("redirect refused"));
        }
        self.state.record(&self.client, |c| c.redirects.push(server));
        Ok(())
    }

    async fn handle_server_fault(
        &self,
        session: &BalancingSession,
    ) -> anyhow::Result<Arc<BackendServer>> {
        self.state.record(&self.client, |c| c.faults += 1);
        let policy = *self.state.policy.lock();
        match policy {
            FaultPolicy::NextBackup => session
                .next_backup_server()
                .ok_or_else(|| anyhow!("no backup server available")),
            FaultPolicy::Fail => Err(anyhow!("fault handling refused")),
        }
    }
}

/// Wraps a manual detector, counting closes and optionally failing them.
pub(crate) struct TrackedDetector {
    inner: Arc<ManualDetector>,
    fail_close: bool,
    closes: AtomicUsize,
}

impl TrackedDetector {
    pub(crate) fn new(inner: Arc<ManualDetector>, fail_close: bool) -> Self {
        Self {
            inner,
            fail_close,
            closes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaultDetector for TrackedDetector {
    fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint()
    }

    fn start(&self, events: TransitionSender) -> Result<(), DetectorError> {
        self.inner.start(events)
    }

    async fn close(&self) -> Result<(), DetectorError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await?;
        if self.fail_close {
            return Err(DetectorError::Other("socket busy".into()));
        }
        Ok(())
    }
}

type Wrap = Box<dyn Fn(Arc<ManualDetector>) -> Arc<dyn FaultDetector> + Send + Sync>;

struct HarnessDetectors {
    manual: Arc<ManualDetectorFactory>,
    wrap: Option<Wrap>,
}

impl FaultDetectorFactory for HarnessDetectors {
    fn create(&self, endpoint: SocketAddr) -> Result<Arc<dyn FaultDetector>, DetectorError> {
        let detector = self.manual.create(endpoint)?;
        match (&self.wrap, self.manual.detector(endpoint)) {
            (Some(wrap), Some(manual)) => Ok(wrap(manual)),
            _ => Ok(detector),
        }
    }
}

/// A plugin server with one mock plugin over manually driven backends.
pub(crate) struct Harness {
    pub host: PluginServer,
    pub plugin: Arc<BalancingPlugin>,
    pub handler: Arc<MockPluginHandler>,
    detectors: Arc<ManualDetectorFactory>,
}

impl Harness {
    pub(crate) async fn new(servers: &[&str]) -> Self {
        Self::build(servers, None).await
    }

    pub(crate) async fn new_with<F>(servers: &[&str], wrap: F) -> Self
    where
        F: Fn(Arc<ManualDetector>) -> Arc<dyn FaultDetector> + Send + Sync + 'static,
    {
        Self::build(servers, Some(Box::new(wrap))).await
    }

    async fn build(servers: &[&str], wrap: Option<Wrap>) -> Self {
        let host = PluginServer::new("test");
        let handler = Arc::new(MockPluginHandler::new("mock"));
        let detectors = Arc::new(ManualDetectorFactory::new());
        let factory = HarnessDetectors {
            manual: Arc::clone(&detectors),
            wrap,
        };
        let plugin = BalancingPlugin::new(
            host.handle(),
            handler.clone(),
            Arc::new(factory),
            BalancingConfig::default(),
            MetricsCollector::new(),
        );
        host.add_plugin(Arc::clone(&plugin)).unwrap();
        for server in servers {
            plugin.add_backend_server(server, None).await.unwrap();
        }
        Self {
            host,
            plugin,
            handler,
            detectors,
        }
    }

    /// The manual detector behind `addr`.
    pub(crate) fn detector(&self, addr: SocketAddr) -> Arc<ManualDetector> {
        self.detectors.detector(addr).unwrap()
    }

    /// Admit `client` through the plugin server.
    pub(crate) async fn admit(&self, client: &str) -> Result<Arc<BalancingSession>, BalancerError> {
        let mut sessions = self.host.new_session(SessionParameter::new(client)).await?;
        Ok(sessions.remove(0))
    }
}
