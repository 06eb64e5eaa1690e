//! Configuration file watcher for hot reload.
//!
//! Reloads on file changes and on SIGHUP. Only configurations that parse and
//! validate are handed to the reload callback.

use crate::config::{Config, load_config};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Callback invoked with every successfully reloaded configuration.
pub type ReloadCallback = Box<dyn Fn(Config) + Send + Sync>;

/// Editors often write a file in several steps; events closer together than
/// this collapse into one reload.
const SETTLE: Duration = Duration::from_millis(100);

/// Configuration file watcher.
pub struct ConfigWatcher {
    config_path: PathBuf,
    reload_callback: ReloadCallback,
}

impl ConfigWatcher {
    pub fn new(config_path: PathBuf, reload_callback: ReloadCallback) -> Self {
        Self {
            config_path,
            reload_callback,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Watch until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let (tx, mut events) = mpsc::unbounded_channel();
        let watcher = self.watch_file(tx);
        if watcher.is_none() {
            warn!(path = %self.config_path.display(), "file watching disabled, reload on SIGHUP only");
        }

        #[cfg(unix)]
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "failed to setup SIGHUP handler");
                    None
                }
            };

        info!(path = %self.config_path.display(), "config watcher ready");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("config watcher shutting down");
                    break;
                }

                Some(event) = events.recv(), if watcher.is_some() => {
                    if !self.should_reload(&event) {
                        continue;
                    }
                    tokio::time::sleep(SETTLE).await;
                    while events.try_recv().is_ok() {}
                    self.try_reload();
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        match sighup.as_mut() {
                            Some(sig) => sig.recv().await,
                            None => std::future::pending::<Option<()>>().await,
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload();
                }
            }
        }

        drop(watcher);
    }

    /// Start a notify watcher on the config file's directory.
    fn watch_file(&self, tx: mpsc::UnboundedSender<Event>) -> Option<RecommendedWatcher> {
        let mut watcher = match RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        ) {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to create file watcher");
                return None;
            }
        };

        let dir = match self.config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            error!(error = %e, dir = %dir.display(), "failed to watch config directory");
            return None;
        }
        Some(watcher)
    }

    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());
        let is_write = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
        is_our_file && is_write
    }

    /// Load, validate and apply. A bad file keeps the current configuration.
    fn try_reload(&self) {
        match load_config(&self.config_path) {
            Ok(config) => {
                info!(
                    frontends = config.frontends.len(),
                    pools = config.pools.len(),
                    "configuration reloaded"
                );
                (self.reload_callback)(config);
            }
            Err(e) => {
                error!(error = %e, "configuration reload failed, keeping current");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn watcher(path: &str) -> ConfigWatcher {
        ConfigWatcher::new(PathBuf::from(path), Box::new(|_| {}))
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event {
            kind,
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_should_reload_on_write() {
        let w = watcher("/etc/sessionlb/config.yaml");
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert!(w.should_reload(&event(modify, "/etc/sessionlb/config.yaml")));
        assert!(w.should_reload(&event(
            EventKind::Create(CreateKind::File),
            "/etc/sessionlb/config.yaml"
        )));
    }

    #[test]
    fn test_should_not_reload_other_events() {
        let w = watcher("/etc/sessionlb/config.yaml");
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert!(!w.should_reload(&event(modify, "/etc/sessionlb/other.yaml")));
        assert!(!w.should_reload(&event(
            EventKind::Remove(RemoveKind::File),
            "/etc/sessionlb/config.yaml"
        )));
    }

    #[test]
    fn test_invalid_reload_keeps_current() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"frontends: []\npools: []\n").unwrap();

        let applied = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&applied);
        let w = ConfigWatcher::new(
            file.path().to_path_buf(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        w.try_reload();
        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_valid_reload_is_applied() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
frontends:
  - name: rtsp
    listen: "127.0.0.1:8554"
    pool: media
pools:
  - name: media
    servers: ["127.0.0.1:9001"]
"#,
        )
        .unwrap();

        let applied = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&applied);
        let w = ConfigWatcher::new(
            file.path().to_path_buf(),
            Box::new(move |config| {
                assert_eq!(config.pools[0].name, "media");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        w.try_reload();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runs_without_file_watch() {
        let w = watcher("/sessionlb-missing-dir/config.yaml");
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(w.run(rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
