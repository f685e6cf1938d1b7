//! Configuration hot-reload.
//!
//! The [`Reloader`] owns the live snapshot behind an atomic pointer.
//! Readers call [`Reloader::current`] (a single atomic load) and never
//! observe a partially-applied config; writers build a whole new snapshot
//! and publish it with one store. On a successful swap the registered
//! callbacks fan the new snapshot out to components that keep derived
//! state (rate limiter, circuit breakers, log-level table).
//!
//! Triggers: write/create events on the config file debounced by 300 ms,
//! and SIGHUP on Unix.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use arc_swap::ArcSwap;
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::{loader, models::Config};

const DEBOUNCE: Duration = Duration::from_millis(300);

type Callback = Box<dyn Fn(&Arc<Config>) + Send + Sync>;

pub struct Reloader {
    path: PathBuf,
    current: ArcSwap<Config>,
    callbacks: RwLock<Vec<Callback>>,
    // Kept alive for the lifetime of the reloader; dropping it stops
    // event delivery.
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl Reloader {
    pub fn new(path: impl Into<PathBuf>, initial: Config) -> Self {
        Self {
            path: path.into(),
            current: ArcSwap::from_pointee(initial),
            callbacks: RwLock::new(Vec::new()),
            watcher: Mutex::new(None),
        }
    }

    /// The active snapshot. Lock-free; safe to call on every request.
    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Register a callback invoked with each successfully loaded snapshot.
    /// The list is append-only; callbacks must treat snapshots as immutable.
    pub fn on_reload(&self, callback: impl Fn(&Arc<Config>) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .expect("callback list poisoned")
            .push(Box::new(callback));
    }

    /// Load the config from disk, validate, and swap it in on success.
    /// On failure the old snapshot stays live. Returns whether the reload
    /// succeeded.
    pub fn reload(&self) -> bool {
        tracing::info!(path = %self.path.display(), "reloading configuration");

        let new_cfg = match loader::load(&self.path) {
            Ok(cfg) => Arc::new(cfg),
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "config reload failed, keeping current snapshot"
                );
                return false;
            }
        };

        for warning in &new_cfg.warnings {
            tracing::warn!(message = %warning, "config warning");
        }

        let old = self.current.swap(new_cfg.clone());
        log_changes(&old, &new_cfg);

        let callbacks = self.callbacks.read().expect("callback list poisoned");
        for cb in callbacks.iter() {
            cb(&new_cfg);
        }

        tracing::info!("configuration reloaded");
        true
    }

    /// Start the file watcher and (on Unix) the SIGHUP listener. Call once
    /// from an async context after construction.
    pub fn start(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel::<()>(8);

        let file_name = self.path.file_name().map(|n| n.to_owned());
        let event_tx = tx.clone();
        let watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = event.kind.is_modify() || event.kind.is_create();
                    let matches_file = file_name.as_ref().map_or(true, |name| {
                        event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(name.as_os_str()))
                    });
                    if relevant && matches_file {
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "config file watcher error"),
            },
        );

        match watcher {
            Ok(mut watcher) => {
                let watch_dir = self.path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = watcher.watch(watch_dir, RecursiveMode::NonRecursive) {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %e,
                        "failed to watch config file"
                    );
                } else {
                    tracing::info!(path = %self.path.display(), "config file watcher started");
                    *self.watcher.lock().expect("watcher slot poisoned") = Some(watcher);
                    tokio::spawn(Self::watch_loop(Arc::clone(self), rx));
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to create config file watcher"),
        }

        #[cfg(unix)]
        tokio::spawn(Self::sighup_loop(Arc::clone(self)));
    }

    /// Drains watcher events, reloading at most once per debounce window.
    async fn watch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        while rx.recv().await.is_some() {
            // Editors fire several events per save; let them settle.
            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}
            self.reload();
        }
    }

    #[cfg(unix)]
    async fn sighup_loop(self: Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGHUP handler");
                return;
            }
        };
        while hup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading configuration");
            self.reload();
        }
    }
}

/// Log a summary of what changed between snapshots.
fn log_changes(old: &Config, new: &Config) {
    if old.rate_limit.requests_per_second != new.rate_limit.requests_per_second
        || old.rate_limit.burst_size != new.rate_limit.burst_size
    {
        tracing::info!(
            old_rps = old.rate_limit.requests_per_second,
            new_rps = new.rate_limit.requests_per_second,
            old_burst = old.rate_limit.burst_size,
            new_burst = new.rate_limit.burst_size,
            "rate limit config changed"
        );
    }
    if old.routes.len() != new.routes.len() {
        tracing::info!(
            old = old.routes.len(),
            new = new.routes.len(),
            "route count changed"
        );
    }
    if old.auth.enabled != new.auth.enabled {
        tracing::info!(old = old.auth.enabled, new = new.auth.enabled, "auth enabled changed");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use tempfile::NamedTempFile;

    use super::*;

    fn write_config(file: &mut NamedTempFile, rps: f64) {
        file.as_file_mut().set_len(0).unwrap();
        let raw = format!(
            r#"
rate_limit:
  requests_per_second: {rps}
routes:
  - path_prefix: /api
    backend: http://localhost:3000
"#
        );
        use std::io::Seek;
        file.as_file_mut().rewind().unwrap();
        file.write_all(raw.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn reload_swaps_snapshot_and_notifies() {
        let mut file = NamedTempFile::new().unwrap();
        write_config(&mut file, 100.0);

        let initial = loader::load(file.path()).unwrap();
        let reloader = Reloader::new(file.path(), initial);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        reloader.on_reload(move |cfg| {
            assert_eq!(cfg.rate_limit.requests_per_second, 200.0);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        write_config(&mut file, 200.0);
        assert!(reloader.reload());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reloader.current().rate_limit.requests_per_second, 200.0);
    }

    #[test]
    fn failed_reload_keeps_old_snapshot() {
        let mut file = NamedTempFile::new().unwrap();
        write_config(&mut file, 100.0);

        let initial = loader::load(file.path()).unwrap();
        let reloader = Reloader::new(file.path(), initial);

        use std::io::Seek;
        file.as_file_mut().set_len(0).unwrap();
        file.as_file_mut().rewind().unwrap();
        file.write_all(b"routes: []\n").unwrap();
        file.flush().unwrap();

        assert!(!reloader.reload());
        assert_eq!(reloader.current().rate_limit.requests_per_second, 100.0);
        assert_eq!(reloader.current().routes.len(), 1);
    }

    #[tokio::test]
    async fn file_write_triggers_reload_within_debounce_window() {
        let mut file = NamedTempFile::new().unwrap();
        write_config(&mut file, 100.0);

        let initial = loader::load(file.path()).unwrap();
        let reloader = Arc::new(Reloader::new(file.path(), initial));
        reloader.start();

        // Give the watcher a beat to register before mutating the file.
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_config(&mut file, 200.0);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if reloader.current().rate_limit.requests_per_second == 200.0 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "reload did not take effect in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
