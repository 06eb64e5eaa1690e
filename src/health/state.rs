//! Health states and the transitions detectors report.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Reachability of a backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Up,
    Down,
}

impl Health {
    /// Whether the backend can take sessions.
    pub fn is_up(self) -> bool {
        matches!(self, Health::Up)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Up => f.write_str("up"),
            Health::Down => f.write_str("down"),
        }
    }
}

/// Why a backend was declared down.
///
/// Carried as data on the circuit breaker and handed to observers; never
/// returned as an operation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("no heartbeat received within {0:?}")]
    HeartbeatMissed(Duration),

    #[error("{0}")]
    Reported(String),
}

/// A flip of a backend's health as seen by one detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub health: Health,
    /// Reason for a `Down` transition.
    pub error: Option<FaultError>,
}

impl Transition {
    /// The backend became reachable.
    pub fn up() -> Self {
        Self {
            health: Health::Up,
            error: None,
        }
    }

    /// The backend became unreachable.
    pub fn down(error: FaultError) -> Self {
        Self {
            health: Health::Down,
            error: Some(error),
        }
    }
}

/// Channel on which a detector reports transitions to its breaker.
pub type TransitionSender = mpsc::UnboundedSender<Transition>;

/// Suppresses repeated reports of the same health.
///
/// Every detector assumes a backend is up when monitoring starts.
#[derive(Debug)]
pub(crate) struct Debouncer {
    endpoint: SocketAddr,
    health: Health,
    events: TransitionSender,
}

impl Debouncer {
    pub(crate) fn new(endpoint: SocketAddr, events: TransitionSender) -> Self {
        Self {
            endpoint,
            health: Health::Up,
            events,
        }
    }

    /// Forward `transition` if it flips the current health.
    ///
    /// Returns `true` when the health flipped.
    pub(crate) fn report(&mut self, transition: Transition) -> bool {
        if transition.health == self.health {
            return false;
        }
        self.health = transition.health;
        debug!(server = %self.endpoint, health = %transition.health, "detector observed health flip");
        // The breaker may already be gone during shutdown.
        let _ = self.events.send(transition);
        true
    }

    pub(crate) fn health(&self) -> Health {
        self.health
    }
}
