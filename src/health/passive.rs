//! Passive fault detection over UDP heartbeats.
//!
//! Backends send a beacon every `frequency` to the balancer's heartbeat
//! server. The payload is the backend's advertised service address in UTF-8;
//! an empty payload stands for the datagram's source address. A backend whose
//! beacons stop for longer than `timeout` is reported down, and the next
//! beacon reports it up.

use crate::health::{
    Debouncer, DetectorError, FaultDetector, FaultDetectorFactory, FaultError, Transition,
    TransitionSender,
};
use crate::util::ShutdownSignal;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, info, trace, warn};

type Observers = Arc<DashMap<SocketAddr, mpsc::UnboundedSender<()>>>;

/// UDP listener shared by every [`HeartbeatDetector`].
#[derive(Clone)]
pub struct HeartbeatServer {
    local_addr: SocketAddr,
    observers: Observers,
    shutdown: ShutdownSignal,
}

impl HeartbeatServer {
    /// Bind the listener and start receiving beacons.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let observers: Observers = Arc::new(DashMap::new());
        let shutdown = ShutdownSignal::new();

        info!(address = %local_addr, "heartbeat server listening");
        tokio::spawn(receive_beacons(
            socket,
            Arc::clone(&observers),
            shutdown.subscribe(),
        ));

        Ok(Self {
            local_addr,
            observers,
            shutdown,
        })
    }

    /// Address backends should send beacons to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Create a detector for beacons advertising `endpoint`.
    pub fn observe(&self, endpoint: SocketAddr, timeout: Duration) -> HeartbeatDetector {
        HeartbeatDetector {
            endpoint,
            timeout,
            server: self.clone(),
            shutdown: ShutdownSignal::new(),
            task: Mutex::new(None),
        }
    }

    /// Stop receiving beacons. Detectors still running will report their
    /// backends down once the timeout elapses.
    pub fn stop(&self) {
        if self.shutdown.shutdown() {
            self.observers.clear();
            info!(address = %self.local_addr, "heartbeat server stopped");
        }
    }

    fn register(&self, endpoint: SocketAddr) -> Result<mpsc::UnboundedReceiver<()>, DetectorError> {
        if self.shutdown.is_shutdown() {
            return Err(DetectorError::ServerStopped);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        match self.observers.entry(endpoint) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DetectorError::AlreadyObserved(endpoint)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    fn unregister(&self, endpoint: SocketAddr) {
        self.observers.remove(&endpoint);
    }
}

async fn receive_beacons(
    socket: UdpSocket,
    observers: Observers,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, source) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "failed to receive heartbeat");
                        continue;
                    }
                };
                let Some(endpoint) = parse_beacon(&buf[..n], source) else {
                    debug!(source = %source, "ignoring malformed heartbeat");
                    continue;
                };
                match observers.get(&endpoint) {
                    Some(observer) => {
                        trace!(server = %endpoint, "heartbeat received");
                        let _ = observer.send(());
                    }
                    None => trace!(server = %endpoint, "heartbeat from unobserved backend"),
                }
            }

            _ = shutdown.recv() => break,
        }
    }
}

/// Decode the endpoint a beacon advertises.
fn parse_beacon(payload: &[u8], source: SocketAddr) -> Option<SocketAddr> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        return Some(source);
    }
    text.parse().ok()
}

/// Detector fed by beacons from a [`HeartbeatServer`].
pub struct HeartbeatDetector {
    endpoint: SocketAddr,
    timeout: Duration,
    server: HeartbeatServer,
    shutdown: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl FaultDetector for HeartbeatDetector {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn start(&self, events: TransitionSender) -> Result<(), DetectorError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(DetectorError::AlreadyStarted(self.endpoint));
        }
        let beacons = self.server.register(self.endpoint)?;
        *task = Some(tokio::spawn(monitor(
            self.endpoint,
            self.timeout,
            beacons,
            Debouncer::new(self.endpoint, events),
            self.shutdown.clone(),
        )));
        Ok(())
    }

    async fn close(&self) -> Result<(), DetectorError> {
        if self.shutdown.shutdown() {
            self.server.unregister(self.endpoint);
        }
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

async fn monitor(
    endpoint: SocketAddr,
    timeout: Duration,
    mut beacons: mpsc::UnboundedReceiver<()>,
    mut debouncer: Debouncer,
    shutdown: ShutdownSignal,
) {
    let mut shutdown_rx = shutdown.subscribe();
    if shutdown.is_shutdown() {
        return;
    }
    debug!(server = %endpoint, timeout = ?timeout, "heartbeat detector starting");

    loop {
        tokio::select! {
            beacon = beacons.recv() => {
                if beacon.is_none() {
                    // Heartbeat server stopped; stay silent until the
                    // timeout declares the backend down.
                    tokio::select! {
                        _ = sleep(timeout) => {
                            debouncer.report(Transition::down(FaultError::HeartbeatMissed(timeout)));
                        }
                        _ = shutdown_rx.recv() => {}
                    }
                    break;
                }
                debouncer.report(Transition::up());
            }

            _ = sleep(timeout) => {
                debouncer.report(Transition::down(FaultError::HeartbeatMissed(timeout)));
            }

            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Builds heartbeat detectors observed by one shared server.
#[derive(Clone)]
pub struct HeartbeatDetectorFactory {
    server: HeartbeatServer,
    timeout: Duration,
}

impl HeartbeatDetectorFactory {
    pub fn new(server: HeartbeatServer, timeout: Duration) -> Self {
        Self { server, timeout }
    }
}

impl FaultDetectorFactory for HeartbeatDetectorFactory {
    fn create(&self, endpoint: SocketAddr) -> Result<Arc<dyn FaultDetector>, DetectorError> {
        Ok(Arc::new(self.server.observe(endpoint, self.timeout)))
    }
}

/// Backend side of the heartbeat protocol.
///
/// Sends a beacon advertising `advertised` to `target` every `frequency`
/// until `shutdown` fires. The beacon names the service address explicitly
/// because the datagrams leave from an ephemeral port.
pub async fn send_heartbeats(
    target: SocketAddr,
    advertised: SocketAddr,
    frequency: Duration,
    shutdown: ShutdownSignal,
) -> io::Result<()> {
    let bind: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    let payload = advertised.to_string();
    let mut shutdown_rx = shutdown.subscribe();
    if shutdown.is_shutdown() {
        return Ok(());
    }

    let mut ticker = interval(frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                socket.send_to(payload.as_bytes(), target).await?;
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}
