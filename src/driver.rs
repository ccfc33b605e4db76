//! The two interfaces a host program implements to plug storage and
//! authentication into the server.

use crate::context::ClientContext;
use crate::error::FtpResult;
use crate::settings::Settings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// Flags a `RETR`/`STOR`/`APPE` open is requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        write: false,
        append: false,
    };
    pub const WRITE: OpenFlags = OpenFlags {
        write: true,
        append: false,
    };
    pub const APPEND: OpenFlags = OpenFlags {
        write: true,
        append: true,
    };
}

/// A file as exposed by a `ClientFilesystem`: readable, writable,
/// seekable (for `REST`), and nothing more. Any type satisfying the
/// supertraits gets this for free — `tokio::fs::File` included.
pub trait FileStream: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send> FileStream for T {}

/// One entry as returned by `ListFiles`/`GetFileInfo`.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Unix-style permission string, e.g. `"rwxr-xr-x"`.
    pub mode: String,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

/// The per-user virtual filesystem capability set.
///
/// Implementations need not correspond to a real filesystem and are not
/// responsible for anything outside of what each method says; in
/// particular path containment (keeping a user inside their root) is the
/// implementation's job, not the library's.
#[async_trait]
pub trait ClientFilesystem: Send + Sync {
    async fn open_file(&self, ctx: &ClientContext, path: &str, flags: OpenFlags) -> FtpResult<Box<dyn FileStream>>;

    async fn get_file_info(&self, ctx: &ClientContext, path: &str) -> FtpResult<FileInfo>;

    async fn list_files(&self, ctx: &ClientContext, path: &str) -> FtpResult<Vec<FileInfo>>;

    async fn make_directory(&self, ctx: &ClientContext, path: &str) -> FtpResult<()>;

    /// Used for both files and empty directories.
    async fn delete_file(&self, ctx: &ClientContext, path: &str) -> FtpResult<()>;

    async fn rename_file(&self, ctx: &ClientContext, from: &str, to: &str) -> FtpResult<()>;

    async fn chmod_file(&self, ctx: &ClientContext, path: &str, mode: u32) -> FtpResult<()>;

    /// Non-blocking yes/no quota hook backing `ALLO`. This is not a
    /// general quota engine — just enough for a driver to refuse a
    /// pre-declared transfer size.
    async fn can_allocate(&self, ctx: &ClientContext, size: u64) -> FtpResult<bool>;

    async fn change_directory(&self, ctx: &ClientContext, path: &str) -> FtpResult<()>;
}

/// The host-implemented driver: authentication, TLS material, settings,
/// and lifecycle notifications.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Called once at `Server::listen`.
    async fn get_settings(&self) -> FtpResult<Settings>;

    /// Called on every `AUTH TLS`. May rebuild or cache internally; the
    /// library never caches this on the driver's behalf (specification
    /// §5 "Shared resources").
    async fn get_tls_config(&self) -> FtpResult<Arc<rustls::ServerConfig>>;

    /// Produces the body of the `220` welcome reply. An error becomes a
    /// `421` and the session terminates without ever reaching the
    /// command loop.
    async fn welcome_user(&self, ctx: &ClientContext) -> FtpResult<String>;

    /// Validates credentials and, on success, hands back the per-user
    /// virtual filesystem for the remainder of the session.
    async fn auth_user(&self, ctx: &ClientContext, user: &str, pass: &str) -> FtpResult<Arc<dyn ClientFilesystem>>;

    /// Called exactly once per session that produced a `welcome_user`
    /// call, regardless of how the session ended.
    async fn user_left(&self, ctx: &ClientContext);
}
