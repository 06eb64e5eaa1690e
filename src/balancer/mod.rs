//! Session-aware balancing over a pool of monitored backends.
//!
//! Backends are registered with a [`BalancingPlugin`], which wraps each one
//! in a [`CircuitBreaker`] fed by a fault detector. Clients are admitted
//! through a [`PluginServer`], which asks each plugin for a
//! [`BalancingSession`] on the least loaded healthy backends. When a
//! session's primary goes down the session fails over to a backup.

mod breaker;
mod error;
mod handler;
mod host;
mod plugin;
pub mod selection;
mod server;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use breaker::{CircuitBreaker, ObserverId, StateChange};
pub use error::{BalancerError, FailoverError, MultiError};
pub use handler::{BalancingPluginHandler, BalancingSessionHandler, SessionParameter};
pub use host::{PluginServer, ServerHandle};
pub use plugin::{BalancingPlugin, StateCallback};
pub use selection::Selection;
pub use server::{BackendServer, Load, Role};
pub use session::{BalancingSession, FailoverOutcome};
