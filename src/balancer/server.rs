//! Backend servers and their session registrations.

use crate::balancer::{BalancingSession, CircuitBreaker};
use crate::health::Health;
use crate::util::SessionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static REGISTRATION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Role a backend plays for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Primary,
    Backup,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Backup => "backup",
        }
    }
}

/// Session counts on one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Load {
    pub primary: usize,
    pub backup: usize,
}

impl Load {
    /// `primary + backup * backup_weight`.
    pub fn score(&self, backup_weight: f64) -> f64 {
        self.primary as f64 + self.backup as f64 * backup_weight
    }
}

struct Assignment {
    role: Role,
    session: Weak<BalancingSession>,
}

/// A resolved backend, its circuit breaker and the sessions assigned to it.
pub struct BackendServer {
    id: u64,
    addr: SocketAddr,
    breaker: CircuitBreaker,
    sessions: Mutex<HashMap<SessionId, Assignment>>,
}

impl BackendServer {
    /// Wrap a bound breaker.
    pub fn new(addr: SocketAddr, breaker: CircuitBreaker) -> Self {
        Self {
            id: REGISTRATION_COUNTER.fetch_add(1, Ordering::Relaxed),
            addr,
            breaker,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Monotonic registration number; breaks load ties.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn health(&self) -> Health {
        self.breaker.health()
    }

    pub fn is_up(&self) -> bool {
        self.breaker.is_up()
    }

    pub fn load(&self) -> Load {
        let sessions = self.sessions.lock();
        let primary = sessions
            .values()
            .filter(|a| a.role == Role::Primary)
            .count();
        Load {
            primary,
            backup: sessions.len() - primary,
        }
    }

    pub fn load_score(&self, backup_weight: f64) -> f64 {
        self.load().score(backup_weight)
    }

    /// Record `session` in `role`, replacing any previous role.
    pub(crate) fn register_session(&self, session: &Arc<BalancingSession>, role: Role) {
        self.sessions.lock().insert(
            session.id(),
            Assignment {
                role,
                session: Arc::downgrade(session),
            },
        );
    }

    /// Forget `session`. Returns whether it was registered.
    pub(crate) fn unregister_session(&self, id: SessionId) -> bool {
        self.sessions.lock().remove(&id).is_some()
    }

    /// Live sessions for which this backend is the primary.
    pub fn primary_sessions(&self) -> Vec<Arc<BalancingSession>> {
        self.sessions
            .lock()
            .values()
            .filter(|a| a.role == Role::Primary)
            .filter_map(|a| a.session.upgrade())
            .collect()
    }

    pub fn role_of(&self, id: SessionId) -> Option<Role> {
        self.sessions.lock().get(&id).map(|a| a.role)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn assign_for_test(&self, role: Role) {
        self.sessions.lock().insert(
            SessionId::next(),
            Assignment {
                role,
                session: Weak::new(),
            },
        );
    }
}

impl fmt::Display for BackendServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl fmt::Debug for BackendServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendServer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("health", &self.health())
            .field("load", &self.load())
            .finish()
    }
}
