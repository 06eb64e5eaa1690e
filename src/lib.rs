//! sessionlb - session-aware load balancing with failover
//!
//! Backend servers are monitored by fault detectors behind circuit breakers.
//! Each client session is placed on the least loaded healthy backend with
//! backups on the next least loaded ones, and is moved to a backup when its
//! primary goes down.

pub mod balancer;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod state;
pub mod util;

pub use config::Config;
pub use state::AppState;
