//! The server-wide accept loop, client registry, and graceful shutdown.

use crate::context::ClientContext;
use crate::error::{FtpError, FtpResult};
use crate::session::{self, Session};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Upper bound `Server::stop` waits for spawned session tasks to finish
/// before giving up and returning anyway.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Embeds and runs an FTP server driven by a host-supplied [`crate::Driver`].
///
/// Cloning a `Server` shares the same registry and shutdown state — every
/// clone is a handle onto the same running server, shared across
/// spawned connection tasks.
#[derive(Clone)]
pub struct Server {
    driver: Arc<dyn crate::Driver>,
    registry: Arc<Mutex<HashMap<u64, Arc<Session>>>>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Server {
    pub fn new(driver: Arc<dyn crate::Driver>) -> Self {
        Server {
            driver,
            registry: Arc::new(Mutex::new(HashMap::new())),
            handles: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Binds (unless the driver's settings already supply a listener) and
    /// runs the accept loop until [`Server::stop`] is called. Every
    /// accepted connection is handled in its own spawned task; `listen`
    /// itself returns only once no more connections will be accepted.
    pub async fn listen(&self) -> FtpResult<()> {
        let settings = self.driver.get_settings().await?;

        let listener = match settings.listener {
            Some(listener) => listener,
            None => TcpListener::bind(&settings.listen_addr)
                .await
                .map_err(FtpError::Io)?,
        };
        tracing::info!(addr = %settings.listen_addr, "listening");

        let settings = Arc::new(settings);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "could not set TCP_NODELAY");
            }

            let local_addr = match stream.local_addr() {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error = %e, "could not read local address, dropping connection");
                    continue;
                }
            };

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let session = Arc::new(session::new_session(id, remote_addr));
            self.registry.lock().expect("registry mutex poisoned").insert(id, session.clone());

            let ctx = Arc::new(ClientContext::new(id, remote_addr, local_addr));
            let driver = self.driver.clone();
            let settings = settings.clone();
            let registry = self.registry.clone();

            let handle = tokio::spawn(async move {
                session::run(session, ctx, stream, driver, settings).await;
                registry.lock().expect("registry mutex poisoned").remove(&id);
            });
            self.handles.lock().expect("handles mutex poisoned").push(handle);
        }

        Ok(())
    }

    /// Idempotent. Stops the accept loop, signals every registered
    /// session to close its control connection (which also aborts any
    /// in-flight transfer — see `commands::retr`/`stor`/`list_like`
    /// racing the copy against the same shutdown signal), and waits for
    /// every spawned session task to finish, up to `STOP_TIMEOUT`.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        {
            let registry = self.registry.lock().expect("registry mutex poisoned");
            for session in registry.values() {
                session.close();
            }
        }

        let handles = std::mem::take(&mut *self.handles.lock().expect("handles mutex poisoned"));
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(STOP_TIMEOUT, join_all).await.is_err() {
            tracing::warn!("stop() timed out waiting for session tasks to finish");
        }
    }

    /// Number of currently registered (not yet closed) sessions.
    pub fn active_session_count(&self) -> usize {
        self.registry.lock().expect("registry mutex poisoned").len()
    }
}
