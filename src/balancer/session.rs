//! One client's assignment to backend servers and its failover logic.

use crate::balancer::{
    BackendServer, BalancerError, BalancingPlugin, BalancingSessionHandler, FailoverError, Role,
    Selection,
};
use crate::util::SessionId;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Result of one failover attempt.
#[derive(Debug, Clone)]
pub enum FailoverOutcome {
    /// The session now runs on this server.
    Recovered(Arc<BackendServer>),
    /// The attempt was not needed or no longer allowed.
    Skipped,
    /// No replacement could be established. The session must be torn down.
    Terminated(FailoverError),
}

/// A live session: client, primary, ordered backups and protocol handler.
pub struct BalancingSession {
    id: SessionId,
    client: String,
    plugin: Arc<BalancingPlugin>,
    primary: Mutex<Arc<BackendServer>>,
    backups: Mutex<Vec<Arc<BackendServer>>>,
    handler: OnceLock<Box<dyn BalancingSessionHandler>>,
    failover_error: Mutex<Option<FailoverError>>,
    /// Serialises failover and cleanup.
    failover: tokio::sync::Mutex<()>,
    cleaned_up: AtomicBool,
}

impl BalancingSession {
    pub(crate) fn new(
        plugin: Arc<BalancingPlugin>,
        client: String,
        selection: Selection,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::next(),
            client,
            plugin,
            primary: Mutex::new(selection.primary),
            backups: Mutex::new(selection.backups),
            handler: OnceLock::new(),
            failover_error: Mutex::new(None),
            failover: tokio::sync::Mutex::new(()),
            cleaned_up: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn plugin(&self) -> &Arc<BalancingPlugin> {
        &self.plugin
    }

    pub fn primary(&self) -> Arc<BackendServer> {
        self.primary.lock().clone()
    }

    pub fn backups(&self) -> Vec<Arc<BackendServer>> {
        self.backups.lock().clone()
    }

    /// The terminal failover error, once one occurred.
    pub fn failover_error(&self) -> Option<FailoverError> {
        self.failover_error.lock().clone()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    pub fn handler(&self) -> Option<&dyn BalancingSessionHandler> {
        self.handler.get().map(|h| h.as_ref())
    }

    pub(crate) fn attach_handler(&self, handler: Box<dyn BalancingSessionHandler>) {
        if self.handler.set(handler).is_err() {
            warn!(client = %self.client, "session handler already attached");
        }
    }

    /// Record the session on its primary and backups.
    pub(crate) fn register(self: &Arc<Self>) {
        self.primary.lock().register_session(self, Role::Primary);
        for backup in self.backups.lock().iter() {
            backup.register_session(self, Role::Backup);
        }
    }

    fn unregister(&self) {
        self.primary.lock().unregister_session(self.id);
        for backup in self.backups.lock().iter() {
            backup.unregister_session(self.id);
        }
    }

    /// First healthy backup, else the least loaded healthy server not
    /// already assigned to this session.
    pub fn next_backup_server(&self) -> Option<Arc<BackendServer>> {
        let primary = self.primary.lock();
        let backups = self.backups.lock();
        if let Some(backup) = backups.iter().find(|b| b.is_up()) {
            return Some(Arc::clone(backup));
        }
        let exclude: Vec<SocketAddr> = std::iter::once(primary.addr())
            .chain(backups.iter().map(|b| b.addr()))
            .collect();
        self.plugin.pick_replacement(&exclude)
    }

    /// Move the session off `failed`, its primary.
    ///
    /// Runs at most one attempt per failure: a session whose primary is no
    /// longer `failed`, that was cleaned up, or whose failover already failed
    /// is skipped.
    pub async fn fail_over(self: &Arc<Self>, failed: &Arc<BackendServer>) -> FailoverOutcome {
        let _guard = self.failover.lock().await;

        if self.is_cleaned_up() || self.failover_error.lock().is_some() {
            return FailoverOutcome::Skipped;
        }
        if !Arc::ptr_eq(&*self.primary.lock(), failed) {
            debug!(client = %self.client, server = %failed, "primary already replaced");
            return FailoverOutcome::Skipped;
        }
        let Some(handler) = self.handler.get() else {
            return FailoverOutcome::Skipped;
        };

        info!(
            protocol = %self.plugin.protocol(),
            client = %self.client,
            server = %failed,
            "failover started"
        );

        let replacement = match handler.handle_server_fault(self).await {
            Ok(server) if Arc::ptr_eq(&server, failed) => {
                return self.terminate(failed, "no replacement other than the failed server".into());
            }
            Ok(server) => server,
            Err(e) => return self.terminate(failed, format!("{e:#}")),
        };

        self.promote(failed, &replacement);

        if let Err(e) = handler.redirect_stream(replacement.addr()).await {
            return self.terminate(
                failed,
                format!("redirect to {} failed: {e:#}", replacement.addr()),
            );
        }

        info!(
            protocol = %self.plugin.protocol(),
            client = %self.client,
            from = %failed,
            to = %replacement,
            "failover succeeded"
        );
        self.plugin.metrics().record_failover(self.plugin.protocol(), true);
        FailoverOutcome::Recovered(replacement)
    }

    fn promote(self: &Arc<Self>, failed: &Arc<BackendServer>, replacement: &Arc<BackendServer>) {
        {
            let mut primary = self.primary.lock();
            let mut backups = self.backups.lock();

            failed.unregister_session(self.id);
            backups.retain(|b| !Arc::ptr_eq(b, replacement));
            replacement.register_session(self, Role::Primary);
            *primary = Arc::clone(replacement);

            let wanted = self.plugin.config().num_backup_servers;
            while backups.len() < wanted {
                let exclude: Vec<SocketAddr> = [failed.addr(), primary.addr()]
                    .into_iter()
                    .chain(backups.iter().map(|b| b.addr()))
                    .collect();
                let Some(backup) = self.plugin.pick_replacement(&exclude) else {
                    break;
                };
                backup.register_session(self, Role::Backup);
                backups.push(backup);
            }
        }
        self.plugin.resort();
    }

    fn terminate(&self, failed: &BackendServer, reason: String) -> FailoverOutcome {
        let error = FailoverError {
            client: self.client.clone(),
            server: failed.addr(),
            reason,
        };
        warn!(
            protocol = %self.plugin.protocol(),
            client = %self.client,
            server = %failed,
            error = %error.reason,
            "failover failed"
        );
        *self.failover_error.lock() = Some(error.clone());
        self.plugin.metrics().record_failover(self.plugin.protocol(), false);
        FailoverOutcome::Terminated(error)
    }

    /// Release the session's servers and stop the remote side.
    ///
    /// Runs once. After a failed failover the stored error is returned and
    /// the remote is not contacted.
    pub async fn cleanup(&self) -> Result<(), BalancerError> {
        let _guard = self.failover.lock().await;
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.unregister();
        self.plugin.resort();

        if let Some(error) = self.failover_error() {
            return Err(error.into());
        }
        match self.handler.get() {
            Some(handler) => handler
                .stop_remote()
                .await
                .map_err(|reason| BalancerError::Handler {
                    context: format!("failed to stop remote session of client {}", self.client),
                    reason,
                }),
            None => Ok(()),
        }
    }

    /// Like [`cleanup`](Self::cleanup) but fire-and-forget.
    pub fn cleanup_in_background(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = session.failover.lock().await;
            if session.cleaned_up.swap(true, Ordering::SeqCst) {
                return;
            }
            session.unregister();
            session.plugin.resort();
            if session.failover_error().is_none() {
                if let Some(handler) = session.handler.get() {
                    handler.background_stop_remote();
                }
            }
        });
    }

    /// Ask the owning plugin server to tear this client's session down.
    pub fn stop_containing_session(&self) -> bool {
        self.plugin.host().request_stop(&self.client)
    }
}

impl fmt::Debug for BalancingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancingSession")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("primary", &self.primary.lock().addr())
            .field("cleaned_up", &self.is_cleaned_up())
            .finish()
    }
}
