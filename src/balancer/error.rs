//! Balancer error types.

use crate::health::DetectorError;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from registering backends, admitting sessions and shutting down.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("failed to resolve {addr}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} did not resolve to any address")]
    NoAddress(String),

    #[error("backend server {0} is already registered")]
    DuplicateServer(SocketAddr),

    #[error("failed to create fault detector for {addr}")]
    Detector {
        addr: SocketAddr,
        #[source]
        source: DetectorError,
    },

    #[error("failed to create {protocol} client for {addr}: {reason:#}")]
    Client {
        protocol: String,
        addr: SocketAddr,
        reason: anyhow::Error,
    },

    #[error("circuit breaker is already bound to {0}")]
    AlreadyBound(SocketAddr),

    #[error("invalid backend address {0}")]
    InvalidAddress(SocketAddr),

    #[error("circuit breaker is not bound to a server")]
    NotBound,

    #[error("circuit breaker for {0} is already started")]
    AlreadyStarted(SocketAddr),

    #[error("no {protocol} server available to handle the request")]
    NoServerAvailable { protocol: String },

    #[error("failed to create {protocol} session: {reason:#}")]
    SessionCreation {
        protocol: String,
        reason: anyhow::Error,
    },

    #[error("client {0} already has a session")]
    DuplicateSession(String),

    #[error("no balancing plugins registered on server {0}")]
    NoPlugins(String),

    #[error("plugin server {0} is stopped")]
    ServerStopped(String),

    #[error("{protocol} plugin belongs to another plugin server than {server}")]
    ForeignPlugin { protocol: String, server: String },

    #[error("session for client {0} was stopped during admission")]
    StoppedDuringAdmission(String),

    #[error(transparent)]
    Failover(#[from] FailoverError),

    #[error("{context}: {reason:#}")]
    Handler {
        context: String,
        reason: anyhow::Error,
    },

    #[error("error closing connection to {addr}")]
    Close {
        addr: SocketAddr,
        #[source]
        source: DetectorError,
    },
}

/// Terminal failure to move a session off a failed primary.
///
/// Stored on the session and surfaced once when it is cleaned up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failover of client {client} away from {server} failed: {reason}")]
pub struct FailoverError {
    pub client: String,
    pub server: SocketAddr,
    pub reason: String,
}

/// Several errors collected while trying every item of a batch.
#[derive(Debug, Default)]
pub struct MultiError(Vec<BalancerError>);

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: BalancerError) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: MultiError) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errors(&self) -> &[BalancerError] {
        &self.0
    }

    /// `Ok` when nothing was collected.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => f.write_str("no errors"),
            1 => write!(f, "{}", ErrorChain(&self.0[0])),
            n => {
                write!(f, "{n} errors occurred: ")?;
                for (i, error) in self.0.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}", ErrorChain(error))?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl From<BalancerError> for MultiError {
    fn from(error: BalancerError) -> Self {
        Self(vec![error])
    }
}

/// Renders an error followed by its sources.
struct ErrorChain<'a>(&'a BalancerError);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}
