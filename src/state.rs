//! Shared application state.

use crate::balancer::{BalancerError, BalancingPlugin, MultiError, PluginServer, StateCallback};
use crate::config::Config;
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// State shared by the listeners, the config watcher and shutdown.
pub struct AppState {
    /// Current configuration, swapped atomically on reload.
    config: ArcSwap<Config>,
    /// Plugins serving each pool, keyed by pool name.
    plugins: DashMap<String, Vec<Arc<BalancingPlugin>>>,
    servers: Mutex<Vec<PluginServer>>,
    /// Observer attached to every backend registered at runtime.
    observer: Option<StateCallback>,
    shutdown: ShutdownSignal,
}

impl AppState {
    pub fn new(config: Config, observer: Option<StateCallback>) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            plugins: DashMap::new(),
            servers: Mutex::new(Vec::new()),
            observer,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> arc_swap::Guard<Arc<Config>> {
        self.config.load()
    }

    pub fn observer(&self) -> Option<StateCallback> {
        self.observer.clone()
    }

    /// Track a plugin server so it is stopped on shutdown.
    pub fn add_server(&self, server: PluginServer) {
        self.servers.lock().push(server);
    }

    pub fn servers(&self) -> Vec<PluginServer> {
        self.servers.lock().clone()
    }

    /// Record that `plugin` balances over `pool`.
    pub fn register_plugin(&self, pool: &str, plugin: Arc<BalancingPlugin>) {
        self.plugins.entry(pool.to_string()).or_default().push(plugin);
    }

    pub fn plugins_for(&self, pool: &str) -> Vec<Arc<BalancingPlugin>> {
        self.plugins
            .get(pool)
            .map(|plugins| plugins.clone())
            .unwrap_or_default()
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Apply a validated configuration.
    ///
    /// Every server listed under a served pool is offered to each plugin of
    /// that pool; servers already registered are skipped, so a server that
    /// failed to register earlier is retried. Removed servers, new pools and
    /// frontend changes are logged and take effect only after a restart.
    /// Returns how many backends were added.
    pub async fn apply_reload(&self, new: Config) -> Result<usize, MultiError> {
        let current = self.config.load_full();
        let mut errors = MultiError::new();
        let mut added = 0;

        for pool in &new.pools {
            let plugins = self.plugins_for(&pool.name);
            if plugins.is_empty() {
                if current.pool(&pool.name).is_none() {
                    warn!(pool = %pool.name, "new pool ignored until restart");
                }
                continue;
            }
            if let Some(old) = current.pool(&pool.name) {
                let listed: HashSet<&str> = pool.servers.iter().map(String::as_str).collect();
                for removed in old.servers.iter().filter(|s| !listed.contains(s.as_str())) {
                    warn!(pool = %pool.name, server = %removed, "server removal ignored, pools only grow at runtime");
                }
            }

            for server in &pool.servers {
                for plugin in &plugins {
                    match plugin.add_backend_server(server, self.observer()).await {
                        Ok(_) => added += 1,
                        Err(BalancerError::DuplicateServer(_)) => {}
                        Err(e) => errors.push(e),
                    }
                }
            }
        }

        for pool in &current.pools {
            if new.pool(&pool.name).is_none() {
                warn!(pool = %pool.name, "pool removal ignored until restart");
            }
        }
        if frontends_changed(&current, &new) {
            warn!("frontend changes take effect after a restart");
        }

        info!(added, errors = errors.len(), "configuration applied");
        self.config.store(Arc::new(new));
        errors.into_result().map(|()| added)
    }

    /// Stop every plugin server, collecting all failures.
    pub async fn stop(&self) -> Result<(), MultiError> {
        self.shutdown.shutdown();
        let mut errors = MultiError::new();
        for server in self.servers() {
            if let Err(e) = server.stop().await {
                errors.extend(e);
            }
        }
        errors.into_result()
    }
}

fn frontends_changed(old: &Config, new: &Config) -> bool {
    let key = |c: &Config| -> Vec<(String, std::net::SocketAddr, String)> {
        let mut frontends: Vec<_> = c
            .frontends
            .iter()
            .map(|f| (f.name.clone(), f.listen, f.pool.clone()))
            .collect();
        frontends.sort();
        frontends
    };
    key(old) != key(new)
}
