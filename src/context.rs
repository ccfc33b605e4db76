//! The capability the library hands back to the driver.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Non-owning handle to one session's identity and virtual working
/// directory, passed to every `Driver`/`ClientFilesystem` call so the
/// driver can make path- or client-aware decisions without the library
/// exposing its internal `Session` type.
pub struct ClientContext {
    id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    path: Mutex<String>,
    debug: AtomicBool,
}

impl ClientContext {
    pub(crate) fn new(id: u64, remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        ClientContext {
            id,
            remote_addr,
            local_addr,
            path: Mutex::new("/".to_string()),
            debug: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn path(&self) -> String {
        self.path.lock().expect("path mutex poisoned").clone()
    }

    pub fn set_path(&self, path: impl Into<String>) {
        *self.path.lock().expect("path mutex poisoned") = path.into();
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("path", &self.path())
            .finish()
    }
}
