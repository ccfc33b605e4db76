//! Driver-supplied, process-wide configuration.

use std::net::SocketAddr;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Computes the advertised PASV/EPSV host dynamically from the local
/// address of the control connection, e.g. to cope with a server behind
/// several differently-NATed interfaces.
pub type PublicIpResolver = Arc<dyn Fn(SocketAddr) -> String + Send + Sync>;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:2121";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;

/// Settings returned once by [`crate::Driver::get_settings`] at `listen`
/// time.
pub struct Settings {
    /// Bind address used when `listener` is not supplied. Defaults to
    /// `0.0.0.0:2121`.
    pub listen_addr: String,

    /// A pre-built listener that, if present, overrides `listen_addr`.
    pub listener: Option<TcpListener>,

    /// Host advertised in PASV/EPSV replies. Must be reachable by the
    /// client (e.g. the server's NAT-mapped public address), not
    /// necessarily the local bind address.
    pub public_host: Option<String>,

    /// Overrides `public_host` with a value computed per-connection. If
    /// set, takes precedence over `public_host`.
    pub public_ip_resolver: Option<PublicIpResolver>,

    /// Restricts the port a passive listener may bind to. `None` means
    /// any ephemeral port.
    pub data_port_range: Option<Range<u16>>,

    /// Idle timeout applied to the control connection's next read.
    /// Zero disables the timeout.
    pub idle_timeout: Duration,

    pub disable_mlsd: bool,
    pub disable_mlst: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            listener: None,
            public_host: None,
            public_ip_resolver: None,
            data_port_range: None,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            disable_mlsd: false,
            disable_mlst: false,
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("listen_addr", &self.listen_addr)
            .field("has_prebuilt_listener", &self.listener.is_some())
            .field("public_host", &self.public_host)
            .field("has_public_ip_resolver", &self.public_ip_resolver.is_some())
            .field("data_port_range", &self.data_port_range)
            .field("idle_timeout", &self.idle_timeout)
            .field("disable_mlsd", &self.disable_mlsd)
            .field("disable_mlst", &self.disable_mlst)
            .finish()
    }
}

impl Settings {
    /// `idle_timeout == 0` means "disabled"; represented as `None`
    /// internally once settings are applied.
    pub(crate) fn idle_timeout_opt(&self) -> Option<Duration> {
        if self.idle_timeout.is_zero() {
            None
        } else {
            Some(self.idle_timeout)
        }
    }

    /// The host to advertise in a PASV reply for a session whose control
    /// connection is locally bound to `local_addr`, or `None` if the
    /// driver configured neither `public_ip_resolver` nor `public_host`.
    /// Never falls back to `local_addr` itself: behind NAT that address
    /// is not reachable by the client, so a missing configuration is a
    /// PASV failure rather than a guess.
    pub(crate) fn resolve_public_host(&self, local_addr: SocketAddr) -> Option<String> {
        if let Some(resolver) = &self.public_ip_resolver {
            return Some(resolver(local_addr));
        }
        self.public_host.clone()
    }
}
