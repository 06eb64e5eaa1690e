//! Active fault detector.
//!
//! Periodically opens a TCP connection to the backend. A backend that refuses
//! or does not answer within the timeout is reported down; the first
//! successful probe afterwards reports it up again.

use crate::health::{
    Debouncer, DetectorError, FaultDetector, FaultDetectorFactory, FaultError, Transition,
    TransitionSender,
};
use crate::util::ShutdownSignal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info};

/// Probe timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Time between probes.
    pub interval: Duration,
    /// How long a probe may take before the backend counts as down.
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Detector that probes a backend over TCP.
pub struct ProbeDetector {
    endpoint: SocketAddr,
    settings: ProbeSettings,
    shutdown: ShutdownSignal,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeDetector {
    pub fn new(endpoint: SocketAddr, settings: ProbeSettings) -> Self {
        Self {
            endpoint,
            settings,
            shutdown: ShutdownSignal::new(),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FaultDetector for ProbeDetector {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn start(&self, events: TransitionSender) -> Result<(), DetectorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DetectorError::AlreadyStarted(self.endpoint));
        }
        let task = tokio::spawn(run_probes(
            self.endpoint,
            self.settings,
            Debouncer::new(self.endpoint, events),
            self.shutdown.clone(),
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn close(&self) -> Result<(), DetectorError> {
        self.shutdown.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|source| DetectorError::Task {
                endpoint: self.endpoint,
                source,
            })?;
        }
        Ok(())
    }
}

async fn run_probes(
    endpoint: SocketAddr,
    settings: ProbeSettings,
    mut debouncer: Debouncer,
    shutdown: ShutdownSignal,
) {
    let mut shutdown_rx = shutdown.subscribe();
    if shutdown.is_shutdown() {
        return;
    }
    info!(server = %endpoint, interval = ?settings.interval, "probe detector starting");

    let mut ticker = interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let transition = match probe(endpoint, settings.timeout).await {
                    Ok(()) => Transition::up(),
                    Err(error) => {
                        debug!(server = %endpoint, error = %error, "probe failed");
                        Transition::down(error)
                    }
                };
                debouncer.report(transition);
            }

            _ = shutdown_rx.recv() => {
                debug!(server = %endpoint, "probe detector stopping");
                break;
            }
        }
    }
}

/// Perform a single TCP connect probe.
async fn probe(endpoint: SocketAddr, probe_timeout: Duration) -> Result<(), FaultError> {
    match timeout(probe_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(FaultError::ProbeFailed(e.to_string())),
        Err(_) => Err(FaultError::ProbeTimeout(probe_timeout)),
    }
}

/// Builds a [`ProbeDetector`] per backend.
#[derive(Debug, Clone, Default)]
pub struct ProbeDetectorFactory {
    settings: ProbeSettings,
}

impl ProbeDetectorFactory {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }
}

impl FaultDetectorFactory for ProbeDetectorFactory {
    fn create(&self, endpoint: SocketAddr) -> Result<Arc<dyn FaultDetector>, DetectorError> {
        Ok(Arc::new(ProbeDetector::new(endpoint, self.settings)))
    }
}
