//! The data-connection subsystem: passive listener, active dialer, and
//! the `open`/`close` contract that hides which side initiated.

use crate::error::{FtpError, FtpResult};
use crate::settings::Settings;
use crate::tls;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const ACTIVE_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Mirrors the retry budget used in comparable passive-mode
/// implementations (e.g. libunftp's `Pasv` handler) for the case where
/// the first candidate port in the configured range is already taken.
const PASSIVE_BIND_RETRIES: u32 = 32;

/// A data connection negotiated but not yet opened. Exactly one of
/// these may be pending per session; declaring a new one drops the old
/// one, closing its listener.
pub enum TransferHandle {
    Passive { listener: TcpListener },
    Active { addr: SocketAddr },
}

impl TransferHandle {
    /// Binds a passive listener within `settings.data_port_range` (or an
    /// ephemeral port if unset) and returns it alongside the reply
    /// components the PASV/EPSV handler needs.
    pub async fn bind_passive(settings: &Settings, bind_ip: IpAddr) -> FtpResult<(Self, SocketAddr)> {
        let listener = match &settings.data_port_range {
            Some(range) => bind_in_range(bind_ip, range).await?,
            None => TcpListener::bind((bind_ip, 0))
                .await
                .map_err(|e| FtpError::Transfer(format!("could not bind passive listener: {e}")))?,
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| FtpError::Transfer(format!("could not read passive listener address: {e}")))?;
        Ok((TransferHandle::Passive { listener }, local_addr))
    }

    pub fn active(addr: SocketAddr) -> Self {
        TransferHandle::Active { addr }
    }

    /// Consumes the handle, producing the accepted/dialed socket,
    /// optionally wrapped in TLS if `PROT P` is in effect.
    pub async fn open(self, tls_config: Option<Arc<rustls::ServerConfig>>) -> FtpResult<crate::tls::AnyStream> {
        let plain = match self {
            TransferHandle::Passive { listener } => {
                let (stream, _peer) = tokio::time::timeout(Duration::from_secs(60), listener.accept())
                    .await
                    .map_err(|_| FtpError::Transfer("timed out waiting for passive connection".into()))?
                    .map_err(|e| FtpError::Transfer(format!("passive accept failed: {e}")))?;
                stream
            }
            TransferHandle::Active { addr } => tokio::time::timeout(ACTIVE_DIAL_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| FtpError::Transfer("timed out dialing active data connection".into()))?
                .map_err(|e| FtpError::Transfer(format!("could not connect to {addr}: {e}")))?,
        };

        match tls_config {
            Some(cfg) => tls::upgrade(plain, cfg)
                .await
                .map_err(|e| FtpError::Tls(e.to_string())),
            None => Ok(crate::tls::AnyStream::Plain(plain)),
        }
    }
}

async fn bind_in_range(bind_ip: IpAddr, range: &Range<u16>) -> FtpResult<TcpListener> {
    let mut last_err = None;
    for _ in 0..PASSIVE_BIND_RETRIES.min(range.len() as u32).max(1) {
        let port = fastrand_port(range);
        match TcpListener::bind((bind_ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(FtpError::Transfer(format!(
        "no free port in passive range after {PASSIVE_BIND_RETRIES} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn fastrand_port(range: &Range<u16>) -> u16 {
    use rand::Rng;
    if range.start >= range.end {
        return range.start;
    }
    rand::thread_rng().gen_range(range.start..range.end)
}

/// Convenience used by PASV/EPSV handlers: the loopback-or-any bind
/// address is the wildcard matching the control connection's address
/// family.
pub fn wildcard_for(local_addr: SocketAddr) -> IpAddr {
    match local_addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
