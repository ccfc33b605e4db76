//! The per-client control-session state machine.

mod commands;
pub mod listing;
pub mod path;

use crate::command::{is_open_to_unauthenticated, parse_command, Command};
use crate::context::ClientContext;
use crate::driver::{ClientFilesystem, Driver};
use crate::reply::{Reply, ReplyCode};
use crate::settings::Settings;
use crate::tls::AnyStream;
use crate::transfer::TransferHandle;
use futures_util::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// The shared handle the server's client registry keeps for a session:
/// just enough to close it idempotently from another task.
pub struct Session {
    id: u64,
    remote_addr: SocketAddr,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Session {
    fn new(id: u64, remote_addr: SocketAddr) -> Self {
        Session {
            id,
            remote_addr,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Idempotent: only the first caller actually signals shutdown.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn until_closed(&self) {
        // `notify_waiters` only wakes *currently waiting* tasks, so we
        // re-check the flag after registering interest to avoid missing
        // a close that raced ahead of us.
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.shutdown.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Mutable per-command state, exclusively owned by the task running the
/// command loop; nothing else ever touches it, so no lock is needed.
pub(crate) struct SessionState {
    pub user: String,
    pub fs: Option<Arc<dyn ClientFilesystem>>,
    pub rename_from: Option<String>,
    pub restart_offset: u64,
    pub pending_transfer: Option<TransferHandle>,
    pub data_tls: bool,
    pub last_command: (String, String),
}

impl SessionState {
    fn new() -> Self {
        SessionState {
            user: String::new(),
            fs: None,
            rename_from: None,
            restart_offset: 0,
            pending_transfer: None,
            data_tls: false,
            last_command: (String::new(), String::new()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.fs.is_some()
    }

    /// Declaring a new pending transfer handle drops (and thus closes)
    /// whatever was previously pending.
    pub fn set_pending_transfer(&mut self, handle: TransferHandle) {
        self.pending_transfer = Some(handle);
    }

    pub fn take_pending_transfer(&mut self) -> Option<TransferHandle> {
        self.pending_transfer.take()
    }
}

/// Drives one client's control connection to completion. Spawned once
/// per accepted connection by [`crate::Server`].
pub(crate) async fn run(
    session: Arc<Session>,
    ctx: Arc<ClientContext>,
    stream: TcpStream,
    driver: Arc<dyn Driver>,
    settings: Arc<Settings>,
) {
    let (read_half, mut writer) = tokio::io::split(AnyStream::Plain(stream));
    let mut reader = BufReader::new(read_half);
    let mut state = SessionState::new();

    match driver.welcome_user(&ctx).await {
        Ok(greeting) => {
            let reply = Reply::new(ReplyCode::ServiceReady, greeting);
            if write_reply(&mut writer, &reply).await.is_err() {
                driver.user_left(&ctx).await;
                return;
            }
        }
        Err(e) => {
            tracing::warn!(session = session.id(), error = %e, "welcome_user failed");
            let reply = Reply::new(ReplyCode::ServiceNotAvailable, format!("{e}"));
            let _ = write_reply(&mut writer, &reply).await;
            return;
        }
    }

    loop {
        let line = tokio::select! {
            biased;
            _ = session.until_closed() => {
                tracing::info!(session = session.id(), "session closed by server shutdown");
                break;
            }
            line = read_command_line(&mut reader, &settings) => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(session = session.id(), "control connection closed by peer");
                break;
            }
            Err(CommandReadError::Timeout) => {
                let secs = settings.idle_timeout.as_secs();
                let reply = Reply::new(
                    ReplyCode::ServiceNotAvailable,
                    format!("command timeout ({secs} seconds): closing control connection"),
                );
                let _ = write_reply(&mut writer, &reply).await;
                tracing::info!(session = session.id(), "idle timeout, closing");
                break;
            }
            Err(CommandReadError::Io(_)) => break,
        };

        if line.trim().is_empty() {
            continue;
        }

        let cmd = parse_command(&line);
        state.last_command = first_word(&line);

        tracing::debug!(session = session.id(), command = ?cmd, "dispatching");

        if !is_open_to_unauthenticated(&cmd) && !state.is_authenticated() {
            let reply = Reply::new(ReplyCode::NotLoggedIn, "Please login with USER and PASS");
            if write_reply(&mut writer, &reply).await.is_err() {
                break;
            }
            continue;
        }

        let dispatched = AssertUnwindSafe(commands::dispatch(&cmd, &mut state, &mut writer, &ctx, &*driver, &settings, &session))
            .catch_unwind()
            .await;

        let outcome = match dispatched {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = panic_message(&panic);
                tracing::error!(session = session.id(), panic = %msg, "command handler panicked");
                Ok(Reply::new(ReplyCode::SyntaxError, format!("Internal error: {msg}")))
            }
        };

        let should_upgrade_tls = matches!(&cmd, Command::Auth(m) if m == "TLS" || m == "SSL");

        match outcome {
            Ok(reply) => {
                let is_quit = matches!(cmd, Command::Quit);
                if write_reply(&mut writer, &reply).await.is_err() {
                    break;
                }
                if is_quit {
                    break;
                }
            }
            Err(e) if e.is_fatal() => {
                tracing::warn!(session = session.id(), error = %e, "fatal session error");
                break;
            }
            Err(e) => {
                // Ordinary per-command errors get the reply code their
                // variant maps to; a caught panic is the only path that
                // still produces the generic "Internal error" text.
                let reply = Reply::new(e.reply_code(), format!("{e}"));
                if write_reply(&mut writer, &reply).await.is_err() {
                    break;
                }
                continue;
            }
        }

        if should_upgrade_tls {
            match upgrade_control_channel(reader, writer, &*driver).await {
                Ok((new_reader, new_writer)) => {
                    reader = new_reader;
                    writer = new_writer;
                }
                Err(e) => {
                    tracing::error!(session = session.id(), error = %e, "TLS upgrade failed");
                    break;
                }
            }
        }
    }

    session.close();
    driver.user_left(&ctx).await;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn first_word(line: &str) -> (String, String) {
    let line = line.trim_end();
    match line.split_once(' ') {
        Some((cmd, rest)) => (cmd.to_ascii_uppercase(), rest.trim_start().to_string()),
        None => (line.to_ascii_uppercase(), String::new()),
    }
}

enum CommandReadError {
    Timeout,
    Io(std::io::Error),
}

async fn read_command_line(
    reader: &mut BufReader<ReadHalf<AnyStream>>,
    settings: &Settings,
) -> Result<Option<String>, CommandReadError> {
    let read = async {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    };

    match settings.idle_timeout_opt() {
        Some(timeout) => match tokio::time::timeout(timeout, read).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(CommandReadError::Io(e)),
            Err(_) => Err(CommandReadError::Timeout),
        },
        None => read.await.map_err(CommandReadError::Io),
    }
}

async fn write_reply(writer: &mut WriteHalf<AnyStream>, reply: &Reply) -> std::io::Result<()> {
    writer.write_all(reply.render().as_bytes()).await?;
    writer.flush().await
}

/// Rebuilds the buffered reader over a freshly TLS-wrapped stream — no
/// read-ahead may survive past the `AUTH` reply. `reader`/`writer`
/// always originate from the same `tokio::io::split` call, so
/// `unsplit` is guaranteed to succeed.
async fn upgrade_control_channel(
    reader: BufReader<ReadHalf<AnyStream>>,
    writer: WriteHalf<AnyStream>,
    driver: &dyn Driver,
) -> Result<(BufReader<ReadHalf<AnyStream>>, WriteHalf<AnyStream>), crate::error::FtpError> {
    let tls_config = driver.get_tls_config().await?;

    let read_half = reader.into_inner();
    let stream = read_half.unsplit(writer);
    let inner = match stream {
        AnyStream::Plain(tcp) => tcp,
        AnyStream::Tls(_) => return Err(crate::error::FtpError::Tls("control channel is already TLS".into())),
    };

    let upgraded = crate::tls::upgrade(inner, tls_config)
        .await
        .map_err(|e| crate::error::FtpError::Tls(e.to_string()))?;
    let (new_read, new_write) = tokio::io::split(upgraded);
    Ok((BufReader::new(new_read), new_write))
}

pub(crate) fn new_session(id: u64, remote_addr: SocketAddr) -> Session {
    Session::new(id, remote_addr)
}
