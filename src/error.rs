//! Crate-wide error taxonomy.

use crate::reply::ReplyCode;
use std::fmt;

/// Error raised anywhere in the command dispatch path.
///
/// Most variants are translated into a reply line by the caller and
/// never escape the session loop; [`FtpError::reply_code`] is the
/// mapping used for that. Only [`FtpError::Timeout`], [`FtpError::Tls`]
/// and [`FtpError::Io`] tell `Session::run` to terminate the control
/// connection instead of replying.
#[derive(Debug, thiserror::Error)]
pub enum FtpError {
    /// Unknown command or a command that isn't well formed.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Command requires a login the session doesn't have yet.
    #[error("not logged in")]
    Unauthenticated,

    /// The driver or the per-user filesystem rejected the call.
    #[error("driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// No transfer handle declared, or the negotiated one could not be
    /// opened (failed listen/accept/dial).
    #[error("transfer error: {0}")]
    Transfer(String),

    /// The control connection's idle deadline elapsed.
    #[error("command timeout")]
    Timeout,

    /// TLS handshake failure; the underlying socket is no longer usable.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Unrecoverable I/O on the control connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FtpError {
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        FtpError::Driver(Box::new(err))
    }

    pub fn driver_msg(msg: impl fmt::Display) -> Self {
        FtpError::Driver(msg.to_string().into())
    }

    /// Whether this error must terminate the session (vs. being turned
    /// into a reply and continuing the command loop).
    pub fn is_fatal(&self) -> bool {
        matches!(self, FtpError::Timeout | FtpError::Tls(_) | FtpError::Io(_))
    }

    /// The reply code a non-fatal error is reported with on the control
    /// connection. `500` is reserved for a caught handler panic, not
    /// reached through this mapping.
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            FtpError::Syntax(_) => ReplyCode::ParameterSyntaxError,
            FtpError::Unauthenticated => ReplyCode::NotLoggedIn,
            FtpError::Driver(_) => ReplyCode::FileError,
            FtpError::Transfer(_) => ReplyCode::FileError,
            FtpError::Timeout | FtpError::Tls(_) | FtpError::Io(_) => ReplyCode::ServiceNotAvailable,
        }
    }
}

pub type FtpResult<T> = Result<T, FtpError>;
