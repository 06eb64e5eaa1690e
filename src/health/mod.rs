//! Fault detection for backend servers.
//!
//! A detector watches one endpoint and reports health flips on a channel.
//! Three strategies are provided: active TCP probing, passive UDP heartbeats
//! and a manually driven detector.

mod checker;
mod manual;
mod passive;
mod state;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinError;

pub use checker::{ProbeDetector, ProbeDetectorFactory, ProbeSettings};
pub use manual::{ManualDetector, ManualDetectorFactory};
pub use passive::{HeartbeatDetector, HeartbeatDetectorFactory, HeartbeatServer, send_heartbeats};
pub use state::{FaultError, Health, Transition, TransitionSender};

pub(crate) use state::Debouncer;

/// Errors from starting or stopping a detector.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector for {0} already started")]
    AlreadyStarted(SocketAddr),

    #[error("{0} is already observed by the heartbeat server")]
    AlreadyObserved(SocketAddr),

    #[error("heartbeat server is stopped")]
    ServerStopped,

    #[error("monitoring task for {endpoint} failed")]
    Task {
        endpoint: SocketAddr,
        #[source]
        source: JoinError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Monitors the reachability of one backend endpoint.
///
/// `start` spawns the monitoring task and must be called at most once.
/// `close` stops the task and waits for it; it is idempotent.
#[async_trait]
pub trait FaultDetector: Send + Sync {
    /// The endpoint being monitored.
    fn endpoint(&self) -> SocketAddr;

    /// Begin monitoring, reporting flips on `events`.
    fn start(&self, events: TransitionSender) -> Result<(), DetectorError>;

    /// Stop monitoring.
    async fn close(&self) -> Result<(), DetectorError>;
}

/// Creates a detector for a resolved backend endpoint.
pub trait FaultDetectorFactory: Send + Sync {
    fn create(&self, endpoint: SocketAddr) -> Result<Arc<dyn FaultDetector>, DetectorError>;
}

impl<F> FaultDetectorFactory for F
where
    F: Fn(SocketAddr) -> Result<Arc<dyn FaultDetector>, DetectorError> + Send + Sync,
{
    fn create(&self, endpoint: SocketAddr) -> Result<Arc<dyn FaultDetector>, DetectorError> {
        self(endpoint)
    }
}
