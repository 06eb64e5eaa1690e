//! Externally driven fault detector.
//!
//! Health is set by the embedder rather than measured. Useful for
//! maintenance switches and for tests.

use crate::health::{
    DetectorError, FaultDetector, FaultDetectorFactory, FaultError, Health, Transition,
    TransitionSender,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug)]
struct ManualState {
    health: Health,
    error: Option<FaultError>,
    events: Option<TransitionSender>,
    started: bool,
}

/// Detector whose health is flipped by calling [`ManualDetector::fail`] and
/// [`ManualDetector::recover`].
#[derive(Debug)]
pub struct ManualDetector {
    endpoint: SocketAddr,
    state: Mutex<ManualState>,
}

impl ManualDetector {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            state: Mutex::new(ManualState {
                health: Health::Up,
                error: None,
                events: None,
                started: false,
            }),
        }
    }

    /// Current health as last set.
    pub fn health(&self) -> Health {
        self.state.lock().health
    }

    /// Mark the backend down.
    pub fn fail(&self, reason: impl Into<String>) {
        self.set(Transition::down(FaultError::Reported(reason.into())));
    }

    /// Mark the backend up.
    pub fn recover(&self) {
        self.set(Transition::up());
    }

    fn set(&self, transition: Transition) {
        let mut state = self.state.lock();
        if state.health == transition.health {
            return;
        }
        state.health = transition.health;
        state.error = transition.error.clone();
        // Sent while holding the lock so concurrent flips stay ordered.
        if let Some(events) = &state.events {
            let _ = events.send(transition);
        }
    }
}

#[async_trait]
impl FaultDetector for ManualDetector {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn start(&self, events: TransitionSender) -> Result<(), DetectorError> {
        let mut state = self.state.lock();
        if state.started {
            return Err(DetectorError::AlreadyStarted(self.endpoint));
        }
        state.started = true;
        if let Some(error) = state.error.clone() {
            let _ = events.send(Transition::down(error));
        }
        state.events = Some(events);
        Ok(())
    }

    async fn close(&self) -> Result<(), DetectorError> {
        self.state.lock().events = None;
        Ok(())
    }
}

/// Hands out [`ManualDetector`]s and keeps them reachable by endpoint.
#[derive(Default)]
pub struct ManualDetectorFactory {
    detectors: DashMap<SocketAddr, Arc<ManualDetector>>,
}

impl ManualDetectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The detector created for `endpoint`, if any.
    pub fn detector(&self, endpoint: SocketAddr) -> Option<Arc<ManualDetector>> {
        self.detectors.get(&endpoint).map(|d| Arc::clone(d.value()))
    }
}

impl FaultDetectorFactory for ManualDetectorFactory {
    fn create(&self, endpoint: SocketAddr) -> Result<Arc<dyn FaultDetector>, DetectorError> {
        let detector = Arc::new(ManualDetector::new(endpoint));
        self.detectors.insert(endpoint, Arc::clone(&detector));
        Ok(detector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:8554".parse().unwrap()
    }

    #[test]
    fn test_flips_are_reported_once() {
        let detector = ManualDetector::new(endpoint());
        let (tx, mut rx) = mpsc::unbounded_channel();
        detector.start(tx).unwrap();

        detector.fail("maintenance");
        detector.fail("maintenance again");
        detector.recover();
        detector.recover();

        assert_eq!(
            rx.try_recv().unwrap(),
            Transition::down(FaultError::Reported("maintenance".into()))
        );
        assert_eq!(rx.try_recv().unwrap(), Transition::up());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_down_before_start_is_reported_on_start() {
        let detector = ManualDetector::new(endpoint());
        detector.fail("offline");
        assert_eq!(detector.health(), Health::Down);

        let (tx, mut rx) = mpsc::unbounded_channel();
        detector.start(tx).unwrap();
        assert_eq!(rx.try_recv().unwrap().health, Health::Down);
    }

    #[tokio::test]
    async fn test_close_stops_reporting() {
        let detector = ManualDetector::new(endpoint());
        let (tx, mut rx) = mpsc::unbounded_channel();
        detector.start(tx).unwrap();
        detector.close().await.unwrap();
        detector.close().await.unwrap();

        detector.fail("after close");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_factory_keeps_detectors() {
        let factory = ManualDetectorFactory::new();
        let created = factory.create(endpoint()).unwrap();
        assert_eq!(created.endpoint(), endpoint());

        let detector = factory.detector(endpoint()).unwrap();
        detector.fail("x");
        assert_eq!(factory.detector(endpoint()).unwrap().health(), Health::Down);
        assert!(factory.detector("127.0.0.1:1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_start_twice_fails() {
        let detector = ManualDetector::new(endpoint());
        let (tx, _rx) = mpsc::unbounded_channel();
        detector.start(tx.clone()).unwrap();
        assert!(matches!(detector.start(tx), Err(DetectorError::AlreadyStarted(_))));
    }
}
