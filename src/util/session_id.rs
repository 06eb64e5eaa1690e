//! Session identifiers.
//!
//! Every balancing session gets a process-unique id so that backend servers
//! can track their assigned sessions without owning them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for session ids.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a balancing session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next session id.
    pub fn next() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{:016x}", self.0)
    }
}
