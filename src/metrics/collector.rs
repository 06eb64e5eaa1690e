//! Metrics collector using prometheus-client.
//!
//! Provides metrics for session admission, backend health and load,
//! failovers and relayed traffic.

use crate::balancer::{Load, Role};
use crate::health::Health;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;

/// Labels for per-protocol metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtocolLabels {
    pub protocol: String,
}

/// Labels for backend health metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub protocol: String,
    pub server: String,
}

/// Labels for backend session metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendRoleLabels {
    pub protocol: String,
    pub server: String,
    pub role: RoleLabel,
}

/// Labels for health transition metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub protocol: String,
    pub server: String,
    pub health: HealthLabel,
}

/// Labels for failover metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailoverLabels {
    pub protocol: String,
    pub result: FailoverResult,
}

/// Labels for frontend connection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FrontendLabels {
    pub frontend: String,
}

/// Labels for relayed bytes metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub frontend: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RoleLabel {
    Primary,
    Backup,
}

impl From<Role> for RoleLabel {
    fn from(role: Role) -> Self {
        match role {
            Role::Primary => RoleLabel::Primary,
            Role::Backup => RoleLabel::Backup,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthLabel {
    Up,
    Down,
}

impl From<Health> for HealthLabel {
    fn from(health: Health) -> Self {
        match health {
            Health::Up => HealthLabel::Up,
            Health::Down => HealthLabel::Down,
        }
    }
}

/// Outcome of a failover attempt.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FailoverResult {
    Succeeded,
    Failed,
}

/// Direction of relayed bytes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    /// Client to backend.
    Upstream,
    /// Backend to client.
    Downstream,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Sessions admitted.
    sessions_admitted: Family<ProtocolLabels, Counter>,
    /// Admissions rejected.
    admissions_rejected: Family<ProtocolLabels, Counter>,
    /// Backend health gauge (1 = up, 0 = down).
    backend_health: Family<BackendLabels, Gauge>,
    /// Sessions assigned per backend and role.
    backend_sessions: Family<BackendRoleLabels, Gauge>,
    /// Health flips observed.
    health_transitions: Family<TransitionLabels, Counter>,
    /// Failover attempts by result.
    failovers: Family<FailoverLabels, Counter>,
    /// Accepted client connections.
    connections_total: Family<FrontendLabels, Counter>,
    /// Currently open client connections.
    active_connections: Family<FrontendLabels, Gauge>,
    /// Bytes relayed between clients and backends.
    relayed_bytes: Family<BytesLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let sessions_admitted = Family::<ProtocolLabels, Counter>::default();
        let admissions_rejected = Family::<ProtocolLabels, Counter>::default();
        let backend_health = Family::<BackendLabels, Gauge>::default();
        let backend_sessions = Family::<BackendRoleLabels, Gauge>::default();
        let health_transitions = Family::<TransitionLabels, Counter>::default();
        let failovers = Family::<FailoverLabels, Counter>::default();
        let connections_total = Family::<FrontendLabels, Counter>::default();
        let active_connections = Family::<FrontendLabels, Gauge>::default();
        let relayed_bytes = Family::<BytesLabels, Counter>::default();

        registry.register(
            "sessionlb_sessions_admitted",
            "Total number of sessions admitted",
            sessions_admitted.clone(),
        );
        registry.register(
            "sessionlb_admissions_rejected",
            "Total number of session admissions rejected",
            admissions_rejected.clone(),
        );
        registry.register(
            "sessionlb_backend_health",
            "Backend server health status (1=up, 0=down)",
            backend_health.clone(),
        );
        registry.register(
            "sessionlb_backend_sessions",
            "Sessions assigned to a backend server by role",
            backend_sessions.clone(),
        );
        registry.register(
            "sessionlb_health_transitions",
            "Total number of backend health transitions",
            health_transitions.clone(),
        );
        registry.register(
            "sessionlb_failovers",
            "Total number of session failover attempts",
            failovers.clone(),
        );
        registry.register(
            "sessionlb_connections",
            "Total number of client connections accepted",
            connections_total.clone(),
        );
        registry.register(
            "sessionlb_active_connections",
            "Number of open client connections",
            active_connections.clone(),
        );
        registry.register(
            "sessionlb_relayed_bytes",
            "Total bytes relayed",
            relayed_bytes.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                sessions_admitted,
                admissions_rejected,
                backend_health,
                backend_sessions,
                health_transitions,
                failovers,
                connections_total,
                active_connections,
                relayed_bytes,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record the outcome of a session admission.
    pub fn record_admission(&self, protocol: &str, admitted: bool) {
        let labels = ProtocolLabels {
            protocol: protocol.to_string(),
        };
        let family = if admitted {
            &self.inner.sessions_admitted
        } else {
            &self.inner.admissions_rejected
        };
        family.get_or_create(&labels).inc();
    }

    /// Update backend health status.
    pub fn set_backend_health(&self, protocol: &str, server: SocketAddr, health: Health) {
        let labels = BackendLabels {
            protocol: protocol.to_string(),
            server: server.to_string(),
        };
        self.inner
            .backend_health
            .get_or_create(&labels)
            .set(if health.is_up() { 1 } else { 0 });
    }

    /// Publish a backend's current session load.
    pub fn set_backend_sessions(&self, protocol: &str, server: SocketAddr, load: Load) {
        for (role, count) in [(Role::Primary, load.primary), (Role::Backup, load.backup)] {
            let labels = BackendRoleLabels {
                protocol: protocol.to_string(),
                server: server.to_string(),
                role: role.into(),
            };
            self.inner
                .backend_sessions
                .get_or_create(&labels)
                .set(count as i64);
        }
    }

    /// Record a backend health flip.
    pub fn record_health_transition(&self, protocol: &str, server: SocketAddr, health: Health) {
        let labels = TransitionLabels {
            protocol: protocol.to_string(),
            server: server.to_string(),
            health: health.into(),
        };
        self.inner.health_transitions.get_or_create(&labels).inc();
        self.set_backend_health(protocol, server, health);
    }

    /// Record a failover attempt.
    pub fn record_failover(&self, protocol: &str, succeeded: bool) {
        let labels = FailoverLabels {
            protocol: protocol.to_string(),
            result: if succeeded {
                FailoverResult::Succeeded
            } else {
                FailoverResult::Failed
            },
        };
        self.inner.failovers.get_or_create(&labels).inc();
    }

    /// Increment open connections.
    pub fn connection_opened(&self, frontend: &str) {
        let labels = FrontendLabels {
            frontend: frontend.to_string(),
        };
        self.inner.connections_total.get_or_create(&labels).inc();
        self.inner.active_connections.get_or_create(&labels).inc();
    }

    /// Decrement open connections.
    pub fn connection_closed(&self, frontend: &str) {
        let labels = FrontendLabels {
            frontend: frontend.to_string(),
        };
        self.inner.active_connections.get_or_create(&labels).dec();
    }

    /// Record bytes relayed for one client connection.
    pub fn record_relayed(&self, frontend: &str, upstream: u64, downstream: u64) {
        for (direction, bytes) in [
            (Direction::Upstream, upstream),
            (Direction::Downstream, downstream),
        ] {
            let labels = BytesLabels {
                frontend: frontend.to_string(),
                direction,
            };
            self.inner.relayed_bytes.get_or_create(&labels).inc_by(bytes);
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
