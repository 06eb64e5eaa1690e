//! Load-weighted server selection.
//!
//! A backend's score is `primary + backup * backup_weight`. Selection keeps
//! only healthy backends, orders them by score and breaks ties by
//! registration order.

use crate::balancer::BackendServer;
use std::net::SocketAddr;
use std::sync::Arc;

/// Servers picked for a new session.
#[derive(Debug, Clone)]
pub struct Selection {
    pub primary: Arc<BackendServer>,
    pub backups: Vec<Arc<BackendServer>>,
}

/// Sort `servers` ascending by load score, ties by registration order.
pub fn sort_by_load(servers: &mut [Arc<BackendServer>], backup_weight: f64) {
    // Scores are snapshotted: sessions may move while we sort.
    let mut keyed: Vec<(f64, u64, Arc<BackendServer>)> = servers
        .iter()
        .map(|s| (s.load_score(backup_weight), s.id(), Arc::clone(s)))
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    for (slot, (_, _, server)) in servers.iter_mut().zip(keyed) {
        *slot = server;
    }
}

/// Healthy servers, least loaded first.
pub fn rank(servers: &[Arc<BackendServer>], backup_weight: f64) -> Vec<Arc<BackendServer>> {
    let mut up: Vec<Arc<BackendServer>> = servers.iter().filter(|s| s.is_up()).cloned().collect();
    sort_by_load(&mut up, backup_weight);
    up
}

/// Pick a primary and up to `num_backups` backups.
///
/// Returns `None` when no server is up.
pub fn pick(
    servers: &[Arc<BackendServer>],
    num_backups: usize,
    backup_weight: f64,
) -> Option<Selection> {
    let mut ranked = rank(servers, backup_weight).into_iter();
    let primary = ranked.next()?;
    Some(Selection {
        primary,
        backups: ranked.take(num_backups).collect(),
    })
}

/// Least loaded healthy server whose address is not in `exclude`.
pub fn pick_replacement(
    servers: &[Arc<BackendServer>],
    exclude: &[SocketAddr],
    backup_weight: f64,
) -> Option<Arc<BackendServer>> {
    rank(servers, backup_weight)
        .into_iter()
        .find(|s| !exclude.contains(&s.addr()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Role;
    use crate::balancer::testing::backend;
    use crate::health::{FaultError, Transition};

    fn addrs(servers: &[Arc<BackendServer>]) -> Vec<u16> {
        servers.iter().map(|s| s.addr().port()).collect()
    }

    fn pool(ports: &[u16]) -> Vec<Arc<BackendServer>> {
        ports
            .iter()
            .map(|p| Arc::new(backend(&format!("127.0.0.1:{p}"))))
            .collect()
    }

    fn take_down(server: &BackendServer) {
        server
            .breaker()
            .inject(Transition::down(FaultError::Reported("test".into())));
    }

    #[test]
    fn test_sort_is_stable_on_ties() {
        let mut servers = pool(&[8001, 8002, 8003]);
        servers.reverse();
        sort_by_load(&mut servers, 0.1);
        assert_eq!(addrs(&servers), vec![8001, 8002, 8003]);
    }

    #[test]
    fn test_sort_by_score() {
        let mut servers = pool(&[8001, 8002, 8003]);
        servers[0].assign_for_test(Role::Primary);
        servers[1].assign_for_test(Role::Backup);
        servers[1].assign_for_test(Role::Backup);

        sort_by_load(&mut servers, 0.1);
        assert_eq!(addrs(&servers), vec![8003, 8002, 8001]);

        // Backups weigh as much as primaries at weight 1.
        sort_by_load(&mut servers, 1.0);
        assert_eq!(addrs(&servers), vec![8003, 8001, 8002]);
    }

    #[test]
    fn test_pick_primary_and_backups() {
        let servers = pool(&[8001, 8002, 8003]);
        servers[0].assign_for_test(Role::Primary);

        let selection = pick(&servers, 1, 0.1).unwrap();
        assert_eq!(selection.primary.addr().port(), 8002);
        assert_eq!(addrs(&selection.backups), vec![8003]);

        let selection = pick(&servers, 5, 0.1).unwrap();
        assert_eq!(addrs(&selection.backups), vec![8003, 8001]);

        let selection = pick(&servers, 0, 0.1).unwrap();
        assert!(selection.backups.is_empty());
    }

    #[test]
    fn test_pick_skips_down_servers() {
        let servers = pool(&[8001, 8002, 8003]);
        take_down(&servers[0]);
        take_down(&servers[2]);

        let selection = pick(&servers, 1, 0.1).unwrap();
        assert_eq!(selection.primary.addr().port(), 8002);
        assert!(selection.backups.is_empty());
    }

    #[test]
    fn test_pick_none_when_all_down() {
        let servers = pool(&[8001, 8002]);
        take_down(&servers[0]);
        take_down(&servers[1]);
        assert!(pick(&servers, 1, 0.1).is_none());
        assert!(pick(&[], 1, 0.1).is_none());
    }

    #[test]
    fn test_pick_replacement_excludes() {
        let servers = pool(&[8001, 8002, 8003]);
        let exclude: Vec<SocketAddr> = vec![servers[0].addr(), servers[1].addr()];

        let replacement = pick_replacement(&servers, &exclude, 0.1).unwrap();
        assert_eq!(replacement.addr().port(), 8003);

        take_down(&servers[2]);
        assert!(pick_replacement(&servers, &exclude, 0.1).is_none());
    }
}
