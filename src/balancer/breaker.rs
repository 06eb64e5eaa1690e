//! Circuit breaker: one logical connection to a backend.
//!
//! The breaker owns a fault detector, holds the backend's current health and
//! fans every health flip out to its observers. Flips arrive from the
//! detector's task over a channel and are applied by a single delivery task,
//! so observers see them strictly in order.

use crate::balancer::BalancerError;
use crate::health::{FaultDetector, FaultError, Health, Transition};
use crate::util::ShutdownSignal;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A health flip as delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub protocol: String,
    pub server: SocketAddr,
    pub health: Health,
    /// Why the backend went down; `None` on recovery.
    pub error: Option<FaultError>,
}

/// Handle for removing an observer.
pub type ObserverId = u64;

type Observer = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct Status {
    health: Health,
    error: Option<FaultError>,
}

struct Shared {
    status: RwLock<Status>,
    observers: RwLock<Vec<(ObserverId, Observer)>>,
}

impl Shared {
    fn apply(&self, protocol: &str, server: SocketAddr, transition: Transition) {
        let error = {
            let mut status = self.status.write();
            if status.health == transition.health {
                debug!(server = %server, health = %transition.health, "ignoring redundant transition");
                return;
            }
            status.health = transition.health;
            status.error = match transition.health {
                Health::Up => None,
                Health::Down => Some(
                    transition
                        .error
                        .unwrap_or_else(|| FaultError::Reported("backend unreachable".into())),
                ),
            };
            status.error.clone()
        };

        let change = StateChange {
            protocol: protocol.to_string(),
            server,
            health: transition.health,
            error,
        };

        // Snapshot so observers may register or remove observers.
        let observers: Vec<Observer> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(&change);
        }
    }
}

/// Health state and observers for one backend connection.
pub struct CircuitBreaker {
    protocol: String,
    detector: Arc<dyn FaultDetector>,
    server: OnceLock<SocketAddr>,
    shared: Arc<Shared>,
    next_observer: AtomicU64,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: ShutdownSignal,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreaker {
    /// Create an unbound breaker for `protocol` driven by `detector`.
    pub fn new(protocol: impl Into<String>, detector: Arc<dyn FaultDetector>) -> Self {
        Self {
            protocol: protocol.into(),
            detector,
            server: OnceLock::new(),
            shared: Arc::new(Shared {
                status: RwLock::new(Status {
                    health: Health::Up,
                    error: None,
                }),
                observers: RwLock::new(Vec::new()),
            }),
            next_observer: AtomicU64::new(1),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: ShutdownSignal::new(),
            delivery: Mutex::new(None),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The detector feeding this breaker.
    pub fn detector(&self) -> &Arc<dyn FaultDetector> {
        &self.detector
    }

    /// Bind the breaker to a backend address. Allowed once.
    pub fn set_server(&self, addr: SocketAddr) -> Result<(), BalancerError> {
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return Err(BalancerError::InvalidAddress(addr));
        }
        self.server
            .set(addr)
            .map_err(|_| BalancerError::AlreadyBound(self.server.get().copied().unwrap_or(addr)))
    }

    /// The bound address, if any.
    pub fn server(&self) -> Option<SocketAddr> {
        self.server.get().copied()
    }

    pub fn health(&self) -> Health {
        self.shared.status.read().health
    }

    pub fn is_up(&self) -> bool {
        self.health().is_up()
    }

    /// Reason for the current outage; `None` while up.
    pub fn last_error(&self) -> Option<FaultError> {
        self.shared.status.read().error.clone()
    }

    /// Register an observer invoked on every health flip.
    ///
    /// Observers run on the delivery task in registration order and must not
    /// block.
    pub fn add_state_changed_callback<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.shared.observers.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn remove_state_changed_callback(&self, id: ObserverId) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|(observer, _)| *observer != id);
        observers.len() != before
    }

    /// Start the detector and the delivery task.
    pub fn start(&self) -> Result<(), BalancerError> {
        let server = self.server().ok_or(BalancerError::NotBound)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BalancerError::AlreadyStarted(server));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.detector
            .start(tx)
            .map_err(|source| BalancerError::Detector {
                addr: server,
                source,
            })?;

        let task = tokio::spawn(deliver(
            rx,
            Arc::clone(&self.shared),
            self.protocol.clone(),
            server,
            self.shutdown.subscribe(),
        ));
        *self.delivery.lock() = Some(task);
        Ok(())
    }

    /// Stop the detector and wait for in-flight notifications.
    ///
    /// Idempotent. A detector failure is returned after the delivery task
    /// has stopped.
    pub async fn close(&self) -> Result<(), BalancerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.started.store(true, Ordering::SeqCst);

        let addr = self.server().unwrap_or_else(|| self.detector.endpoint());
        let detector_result = self.detector.close().await;

        self.shutdown.shutdown();
        let delivery = self.delivery.lock().take();
        if let Some(delivery) = delivery {
            if let Err(e) = delivery.await {
                warn!(server = %addr, error = %e, "delivery task failed");
            }
        }

        detector_result.map_err(|source| BalancerError::Close { addr, source })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Apply a transition as if the detector had reported it.
    #[cfg(test)]
    pub(crate) fn inject(&self, transition: Transition) {
        let server = self.server().unwrap_or_else(|| self.detector.endpoint());
        self.shared.apply(&self.protocol, server, transition);
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("protocol", &self.protocol)
            .field("server", &self.server())
            .field("health", &self.health())
            .finish()
    }
}

async fn deliver(
    mut events: mpsc::UnboundedReceiver<Transition>,
    shared: Arc<Shared>,
    protocol: String,
    server: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            event = events.recv() => match event {
                Some(transition) => shared.apply(&protocol, server, transition),
                None => break,
            },
        }
    }
    debug!(server = %server, "breaker delivery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{DetectorError, ManualDetector};
    use async_trait::async_trait;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:8554".parse().unwrap()
    }

    fn manual_breaker() -> (CircuitBreaker, Arc<ManualDetector>) {
        let detector = Arc::new(ManualDetector::new(addr()));
        let breaker = CircuitBreaker::new("rtsp", detector.clone());
        (breaker, detector)
    }

    fn recorder(breaker: &CircuitBreaker) -> Arc<Mutex<Vec<StateChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        breaker.add_state_changed_callback(move |change| sink.lock().push(change.clone()));
        seen
    }

    async fn wait_for_len(seen: &Mutex<Vec<StateChange>>, len: usize) {
        for _ in 0..200 {
            if seen.lock().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {len} state changes, saw {}", seen.lock().len());
    }

    struct FailingClose;

    #[async_trait]
    impl FaultDetector for FailingClose {
        fn endpoint(&self) -> SocketAddr {
            addr()
        }

        fn start(&self, _events: crate::health::TransitionSender) -> Result<(), DetectorError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), DetectorError> {
            Err(DetectorError::Other("socket busy".into()))
        }
    }

    #[test]
    fn test_set_server_once() {
        let (breaker, _) = manual_breaker();
        breaker.set_server(addr()).unwrap();
        assert_eq!(breaker.server(), Some(addr()));
        assert!(matches!(
            breaker.set_server("127.0.0.1:9000".parse().unwrap()),
            Err(BalancerError::AlreadyBound(a)) if a == addr()
        ));
    }

    #[test]
    fn test_set_server_rejects_invalid() {
        let (breaker, _) = manual_breaker();
        assert!(matches!(
            breaker.set_server("0.0.0.0:554".parse().unwrap()),
            Err(BalancerError::InvalidAddress(_))
        ));
        assert!(matches!(
            breaker.set_server("127.0.0.1:0".parse().unwrap()),
            Err(BalancerError::InvalidAddress(_))
        ));
        assert_eq!(breaker.server(), None);
    }

    #[test]
    fn test_start_requires_server() {
        let (breaker, _) = manual_breaker();
        assert!(matches!(breaker.start(), Err(BalancerError::NotBound)));
    }

    #[test]
    fn test_observers_in_order_and_redundant_ignored() {
        let (breaker, _) = manual_breaker();
        breaker.set_server(addr()).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        breaker.add_state_changed_callback(move |_| first.lock().push("first"));
        let second = Arc::clone(&order);
        breaker.add_state_changed_callback(move |_| second.lock().push("second"));

        breaker.inject(Transition::up());
        assert!(order.lock().is_empty());

        breaker.inject(Transition::down(FaultError::Reported("gone".into())));
        breaker.inject(Transition::down(FaultError::Reported("still gone".into())));
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(breaker.health(), Health::Down);
        assert_eq!(
            breaker.last_error(),
            Some(FaultError::Reported("gone".into()))
        );

        breaker.inject(Transition::up());
        assert!(breaker.is_up());
        assert_eq!(breaker.last_error(), None);
        assert_eq!(order.lock().len(), 4);
    }

    #[test]
    fn test_down_without_reason_gets_default_error() {
        let (breaker, _) = manual_breaker();
        breaker.set_server(addr()).unwrap();
        breaker.inject(Transition {
            health: Health::Down,
            error: None,
        });
        assert!(breaker.last_error().is_some());
    }

    #[test]
    fn test_remove_observer() {
        let (breaker, _) = manual_breaker();
        breaker.set_server(addr()).unwrap();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let id = breaker.add_state_changed_callback(move |_| *sink.lock() += 1);

        assert!(breaker.remove_state_changed_callback(id));
        assert!(!breaker.remove_state_changed_callback(id));
        breaker.inject(Transition::down(FaultError::Reported("x".into())));
        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test]
    async fn test_detector_flips_reach_observers() {
        let (breaker, detector) = manual_breaker();
        breaker.set_server(addr()).unwrap();
        let seen = recorder(&breaker);
        breaker.start().unwrap();

        detector.fail("maintenance");
        detector.recover();
        wait_for_len(&seen, 2).await;

        let seen = seen.lock();
        assert_eq!(seen[0].health, Health::Down);
        assert_eq!(seen[0].protocol, "rtsp");
        assert_eq!(seen[0].server, addr());
        assert_eq!(
            seen[0].error,
            Some(FaultError::Reported("maintenance".into()))
        );
        assert_eq!(seen[1].health, Health::Up);
        assert_eq!(seen[1].error, None);
        drop(seen);

        breaker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ignores_late_events() {
        let (breaker, detector) = manual_breaker();
        breaker.set_server(addr()).unwrap();
        let seen = recorder(&breaker);
        breaker.start().unwrap();

        breaker.close().await.unwrap();
        breaker.close().await.unwrap();
        assert!(breaker.is_closed());

        detector.fail("late");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());
        assert!(matches!(breaker.start(), Err(BalancerError::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn test_close_returns_detector_error() {
        let breaker = CircuitBreaker::new("rtsp", Arc::new(FailingClose));
        breaker.set_server(addr()).unwrap();
        breaker.start().unwrap();

        let err = breaker.close().await.unwrap_err();
        assert!(matches!(err, BalancerError::Close { addr: a, .. } if a == addr()));
        assert!(breaker.close().await.is_ok());
    }
}
