//! Command handlers. Each handler maps one dispatched [`Command`] onto
//! driver calls and a [`Reply`].

use super::path::abs;
use super::{listing, Session, SessionState};
use crate::command::Command;
use crate::context::ClientContext;
use crate::driver::{ClientFilesystem, Driver, OpenFlags};
use crate::error::{FtpError, FtpResult};
use crate::reply::{Reply, ReplyCode};
use crate::settings::Settings;
use crate::tls::AnyStream;
use crate::transfer::TransferHandle;
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, WriteHalf};

pub(crate) async fn dispatch(
    cmd: &Command,
    state: &mut SessionState,
    writer: &mut WriteHalf<AnyStream>,
    ctx: &ClientContext,
    driver: &dyn Driver,
    settings: &Settings,
    session: &Session,
) -> FtpResult<Reply> {
    match cmd {
        Command::User(name) => user(state, name),
        Command::Pass(pass) => pass_cmd(state, ctx, driver, pass).await,
        Command::Quit => Ok(Reply::new(ReplyCode::ClosingControlConnection, "Goodbye")),
        Command::Auth(mechanism) => auth(mechanism),
        Command::Prot(param) => prot(state, param),
        Command::Pbsz(_) => Ok(Reply::new(ReplyCode::CommandOk, "Whatever")),
        Command::Feat => Ok(feat(settings)),
        Command::Syst => Ok(Reply::new(ReplyCode::SystemType, "UNIX Type: L8")),
        Command::Noop => Ok(Reply::new(ReplyCode::CommandOk, "NOOP ok")),
        Command::Opts(opt) => Ok(opts(opt)),
        Command::Type(t) => Ok(type_(t)),
        Command::Site(arg) => site(state, ctx, driver, arg).await,
        Command::Stat(path) => stat(state, ctx, driver, path.as_deref()).await,
        Command::Size(path) => size(state, ctx, driver, path).await,
        Command::Mdtm(path) => mdtm(state, ctx, driver, path).await,
        Command::Retr(path) => retr(state, writer, ctx, driver, path, session).await,
        Command::Stor(path) => stor(state, writer, ctx, driver, path, OpenFlags::WRITE, session).await,
        Command::Appe(path) => stor(state, writer, ctx, driver, path, OpenFlags::APPEND, session).await,
        Command::Dele(path) => dele(state, ctx, driver, path).await,
        Command::Rnfr(path) => rnfr(state, ctx, driver, path).await,
        Command::Rnto(path) => rnto(state, ctx, driver, path).await,
        Command::Allo(size) => allo(state, ctx, driver, *size).await,
        Command::Rest(offset) => {
            state.restart_offset = *offset;
            Ok(Reply::new(ReplyCode::FileActionPending, "OK"))
        }
        Command::Cwd(path) => cwd(state, ctx, driver, path).await,
        Command::Pwd => Ok(pwd(ctx)),
        Command::Cdup => cdup(state, ctx, driver).await,
        Command::List(path) => list_like(state, writer, ctx, driver, path.as_deref(), ListKind::List, session).await,
        Command::Nlst(path) => list_like(state, writer, ctx, driver, path.as_deref(), ListKind::Nlst, session).await,
        Command::Mlsd(path) => list_like(state, writer, ctx, driver, path.as_deref(), ListKind::Mlsd(settings.disable_mlsd), session).await,
        Command::Mlst(path) => mlst(state, ctx, driver, path.as_deref(), settings.disable_mlst).await,
        Command::Mkd(path) => mkd(state, ctx, driver, path).await,
        Command::Rmd(path) => rmd(state, ctx, driver, path).await,
        Command::Pasv => pasv(state, ctx, settings).await,
        Command::Epsv => epsv(state, ctx, settings).await,
        Command::Port(addr) => {
            state.set_pending_transfer(TransferHandle::active(*addr));
            Ok(Reply::new(ReplyCode::CommandOk, "PORT command successful"))
        }
        Command::Eprt(addr) => {
            state.set_pending_transfer(TransferHandle::active(*addr));
            Ok(Reply::new(ReplyCode::CommandOk, "EPRT command successful"))
        }
        Command::BadArgument(msg) => Ok(Reply::new(ReplyCode::ParameterSyntaxError, *msg)),
        Command::Unknown => Ok(Reply::new(ReplyCode::SyntaxError, "Unknown command")),
    }
}

fn user(state: &mut SessionState, name: &str) -> FtpResult<Reply> {
    state.user = name.to_string();
    Ok(Reply::new(ReplyCode::NeedPassword, "OK"))
}

async fn pass_cmd(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, password: &str) -> FtpResult<Reply> {
    match driver.auth_user(ctx, &state.user, password).await {
        Ok(fs) => {
            state.fs = Some(fs);
            Ok(Reply::new(ReplyCode::UserLoggedIn, "User logged in, proceed"))
        }
        Err(FtpError::Unauthenticated) | Err(FtpError::Driver(_)) => {
            Ok(Reply::new(ReplyCode::NotLoggedIn, "Authentication failed"))
        }
        Err(e) => Err(e),
    }
}

fn auth(mechanism: &str) -> FtpResult<Reply> {
    if mechanism == "TLS" || mechanism == "SSL" {
        Ok(Reply::new(ReplyCode::AuthOk, "AUTH command ok. Expecting TLS Negotiation."))
    } else {
        Ok(Reply::new(ReplyCode::NotImplemented, "Unknown AUTH mechanism"))
    }
}

fn prot(state: &mut SessionState, param: &str) -> FtpResult<Reply> {
    match param {
        "P" => {
            state.data_tls = true;
            Ok(Reply::new(ReplyCode::CommandOk, "Protection set to Private"))
        }
        "C" => {
            state.data_tls = false;
            Ok(Reply::new(ReplyCode::CommandOk, "Protection set to Clear"))
        }
        _ => Ok(Reply::new(ReplyCode::NotImplemented, "Unsupported protection level")),
    }
}

fn feat(settings: &Settings) -> Reply {
    let mut lines = vec!["Features:".to_string(), "UTF8".to_string(), "PASV".to_string(), "EPSV".to_string(), "REST STREAM".to_string(), "SIZE".to_string(), "MDTM".to_string(), "AUTH TLS".to_string(), "PBSZ".to_string(), "PROT".to_string()];
    if !settings.disable_mlsd {
        lines.push("MLSD".to_string());
    }
    if !settings.disable_mlst {
        lines.push("MLST Type*;Size*;Modify*;".to_string());
    }
    lines.push("End".to_string());
    Reply::multiline(ReplyCode::SystemStatus, lines)
}

fn opts(opt: &str) -> Reply {
    if opt.eq_ignore_ascii_case("UTF8 ON") {
        Reply::new(ReplyCode::CommandOk, "UTF8 enabled")
    } else {
        Reply::new(ReplyCode::NotImplemented, "Option not supported")
    }
}

fn type_(t: &str) -> Reply {
    match t.split_whitespace().next().unwrap_or("") {
        "I" | "L" => Reply::new(ReplyCode::CommandOk, "Type set to I"),
        "A" => Reply::new(ReplyCode::CommandOk, "Type set to A (no translation performed)"),
        _ => Reply::new(ReplyCode::ParameterSyntaxError, "Unsupported TYPE"),
    }
}

async fn site(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, arg: &str) -> FtpResult<Reply> {
    let _ = driver;
    let mut parts = arg.splitn(2, ' ');
    match parts.next().unwrap_or("").to_uppercase().as_str() {
        "CHMOD" => {
            let rest = parts.next().unwrap_or("");
            let mut rest = rest.splitn(2, ' ');
            let mode = rest.next().unwrap_or("");
            let path = rest.next().unwrap_or("");
            let mode = u32::from_str_radix(mode, 8).map_err(|_| FtpError::Syntax("bad mode".into()))?;
            let fs = require_fs(state)?;
            let full = abs(&ctx.path(), path);
            fs.chmod_file(ctx, &full, mode).await?;
            Ok(Reply::new(ReplyCode::FileActionOk, "SITE CHMOD command ok"))
        }
        "HELP" | "" => Ok(Reply::new(ReplyCode::CommandOk, "SITE CHMOD is the only supported subcommand")),
        _ => Ok(Reply::new(ReplyCode::NotImplemented, "Unknown SITE subcommand")),
    }
}

async fn stat(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: Option<&str>) -> FtpResult<Reply> {
    let _ = driver;
    match path {
        None => Ok(Reply::multiline(
            ReplyCode::SystemStatus,
            [format!("Connected, user={}", state.user), "End".to_string()],
        )),
        Some(path) => {
            let fs = require_fs(state)?;
            let full = abs(&ctx.path(), path);
            let entries = fs.list_files(ctx, &full).await?;
            let now = Utc::now();
            let mut lines: Vec<String> = vec![format!("Status of {path}:")];
            for entry in &entries {
                lines.push(listing::unix_list_line(entry, now).trim_end().to_string());
            }
            lines.push("End of status".to_string());
            Ok(Reply::multiline(ReplyCode::FileStatus, lines))
        }
    }
}

async fn size(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: &str) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    let info = fs.get_file_info(ctx, &full).await?;
    Ok(Reply::new(ReplyCode::FileStatus, info.size.to_string()))
}

async fn mdtm(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: &str) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    let info = fs.get_file_info(ctx, &full).await?;
    Ok(Reply::new(ReplyCode::FileStatus, info.modified.format("%Y%m%d%H%M%S").to_string()))
}

async fn dele(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: &str) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    fs.delete_file(ctx, &full).await?;
    Ok(Reply::new(ReplyCode::FileActionOk, "Delete successful"))
}

async fn rnfr(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: &str) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    fs.get_file_info(ctx, &full).await?;
    state.rename_from = Some(full);
    Ok(Reply::new(ReplyCode::FileActionPending, "Ready for RNTO"))
}

async fn rnto(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: &str) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    let from = state.rename_from.take().ok_or_else(|| FtpError::Transfer("RNFR required first".into()))?;
    let to = abs(&ctx.path(), path);
    fs.rename_file(ctx, &from, &to).await?;
    Ok(Reply::new(ReplyCode::FileActionOk, "Done !"))
}

async fn allo(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, size: u64) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    // Distinguish "no space" (550) from a driver error (500).
    match fs.can_allocate(ctx, size).await {
        Ok(true) => Ok(Reply::new(ReplyCode::CommandOk, "Command okay")),
        Ok(false) => Ok(Reply::new(ReplyCode::FileError, "Insufficient storage space")),
        Err(_) => Ok(Reply::new(ReplyCode::SyntaxError, "ALLO failed")),
    }
}

async fn cwd(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: &str) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    fs.change_directory(ctx, &full).await?;
    ctx.set_path(full);
    Ok(Reply::new(ReplyCode::FileActionOk, "Directory successfully changed"))
}

fn pwd(ctx: &ClientContext) -> Reply {
    Reply::new(ReplyCode::PathCreated, format!("\"{}\" is the current directory", ctx.path()))
}

async fn cdup(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver) -> FtpResult<Reply> {
    let current = ctx.path();
    let parent = match current.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => current[..idx].to_string(),
        None => "/".to_string(),
    };
    cwd(state, ctx, driver, &parent).await
}

enum ListKind {
    List,
    Nlst,
    Mlsd(bool),
}

async fn list_like(
    state: &mut SessionState,
    writer: &mut WriteHalf<AnyStream>,
    ctx: &ClientContext,
    driver: &dyn Driver,
    path: Option<&str>,
    kind: ListKind,
    session: &Session,
) -> FtpResult<Reply> {
    if matches!(kind, ListKind::Mlsd(true)) {
        return Ok(Reply::new(ReplyCode::NotImplemented, "MLSD has been disabled"));
    }

    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path.unwrap_or("."));
    let entries = fs.list_files(ctx, &full).await?;

    let handle = state
        .take_pending_transfer()
        .ok_or_else(|| FtpError::Transfer("No passive connection declared".into()))?;
    let tls = data_tls_config(state, driver).await?;

    write_interim(writer, ReplyCode::DataConnectionOpen, "Opening data connection for directory listing").await?;

    let body = match kind {
        ListKind::List => listing::render_list(&entries, Utc::now()),
        ListKind::Nlst => listing::render_nlst(&entries),
        ListKind::Mlsd(false) => listing::render_mlsd(&entries),
        ListKind::Mlsd(true) => unreachable!(),
    };

    let transfer = async {
        let mut data = handle.open(tls).await?;
        data.write_all(body.as_bytes()).await.map_err(FtpError::Io)?;
        data.shutdown().await.map_err(FtpError::Io)?;
        Ok::<(), FtpError>(())
    };
    let result = tokio::select! {
        biased;
        _ = session.until_closed() => Err(FtpError::Transfer("session is shutting down".into())),
        result = transfer => result,
    };

    match result {
        Ok(()) => Ok(Reply::new(ReplyCode::ClosingDataConnection, "Transfer complete")),
        Err(e) => Err(e),
    }
}

async fn mlst(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: Option<&str>, disabled: bool) -> FtpResult<Reply> {
    let _ = driver;
    if disabled {
        return Ok(Reply::new(ReplyCode::NotImplemented, "MLST has been disabled"));
    }
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path.unwrap_or("."));
    let info = fs.get_file_info(ctx, &full).await?;
    Ok(Reply::multiline(
        ReplyCode::FileActionOk,
        ["File details".to_string(), listing::mlsx_fact_line(&info), "End of file details".to_string()],
    ))
}

async fn mkd(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: &str) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    fs.make_directory(ctx, &full).await?;
    Ok(Reply::new(ReplyCode::PathCreated, format!("\"{full}\" created")))
}

async fn rmd(state: &mut SessionState, ctx: &ClientContext, driver: &dyn Driver, path: &str) -> FtpResult<Reply> {
    let _ = driver;
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    fs.delete_file(ctx, &full).await?;
    Ok(Reply::new(ReplyCode::FileActionOk, "Directory removed"))
}

async fn pasv(state: &mut SessionState, ctx: &ClientContext, settings: &Settings) -> FtpResult<Reply> {
    if ctx.local_addr().is_ipv6() {
        return Ok(Reply::new(
            ReplyCode::NotImplemented,
            "PASV is not supported on an IPv6 control connection; use EPSV",
        ));
    }
    let host = settings.resolve_public_host(ctx.local_addr()).ok_or_else(|| {
        FtpError::Transfer("no public host configured for PASV; set Settings::public_host or public_ip_resolver".into())
    })?;
    let ip: std::net::Ipv4Addr = host
        .parse()
        .map_err(|_| FtpError::Transfer(format!("configured public host '{host}' is not a dotted IPv4 address")))?;

    let bind_ip = crate::transfer::wildcard_for(ctx.local_addr());
    let (handle, local_addr) = TransferHandle::bind_passive(settings, bind_ip).await?;
    state.set_pending_transfer(handle);

    let octets = ip.octets();
    let port = local_addr.port();
    Ok(Reply::new(
        ReplyCode::EnteringPassiveMode,
        format!(
            "Entering Passive Mode ({},{},{},{},{},{})",
            octets[0],
            octets[1],
            octets[2],
            octets[3],
            port / 256,
            port % 256
        ),
    ))
}

async fn epsv(state: &mut SessionState, ctx: &ClientContext, settings: &Settings) -> FtpResult<Reply> {
    let bind_ip = crate::transfer::wildcard_for(ctx.local_addr());
    let (handle, local_addr) = TransferHandle::bind_passive(settings, bind_ip).await?;
    state.set_pending_transfer(handle);
    Ok(Reply::new(
        ReplyCode::EnteringExtendedPassiveMode,
        format!("Entering Extended Passive Mode (|||{}|)", local_addr.port()),
    ))
}

async fn retr(
    state: &mut SessionState,
    writer: &mut WriteHalf<AnyStream>,
    ctx: &ClientContext,
    driver: &dyn Driver,
    path: &str,
    session: &Session,
) -> FtpResult<Reply> {
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    let handle = state
        .take_pending_transfer()
        .ok_or_else(|| FtpError::Transfer("No passive connection declared".into()))?;
    let tls = data_tls_config(state, driver).await?;
    let offset = std::mem::take(&mut state.restart_offset);

    let open_result = fs.open_file(ctx, &full, OpenFlags::READ).await;
    let mut file = match open_result {
        Ok(f) => f,
        Err(e) => return Err(e),
    };
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(FtpError::Io)?;
    }

    write_interim(writer, ReplyCode::DataConnectionOpen, format!("Opening BINARY mode data connection for {path}")).await?;

    let transfer = async {
        let mut data = handle.open(tls).await?;
        let copy_result = tokio::io::copy(&mut file, &mut data).await;
        let _ = data.shutdown().await;
        copy_result.map_err(FtpError::Io)
    };
    let copied = tokio::select! {
        biased;
        _ = session.until_closed() => Err(FtpError::Transfer("session is shutting down".into())),
        result = transfer => result,
    };
    copied.map(|_| Reply::new(ReplyCode::ClosingDataConnection, "Transfer complete"))
}

async fn stor(
    state: &mut SessionState,
    writer: &mut WriteHalf<AnyStream>,
    ctx: &ClientContext,
    driver: &dyn Driver,
    path: &str,
    flags: OpenFlags,
    session: &Session,
) -> FtpResult<Reply> {
    let fs = require_fs(state)?;
    let full = abs(&ctx.path(), path);
    let handle = state
        .take_pending_transfer()
        .ok_or_else(|| FtpError::Transfer("No passive connection declared".into()))?;
    let tls = data_tls_config(state, driver).await?;
    let offset = std::mem::take(&mut state.restart_offset);

    let mut file = fs.open_file(ctx, &full, flags).await?;
    if offset > 0 && !flags.append {
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(FtpError::Io)?;
    }

    write_interim(writer, ReplyCode::DataConnectionOpen, format!("Opening BINARY mode data connection for {path}")).await?;

    let transfer = async {
        let mut data = handle.open(tls).await?;
        let copy_result = tokio::io::copy(&mut data, &mut file).await;
        let shutdown_result = file.shutdown().await;
        copy_result.and(shutdown_result).map_err(FtpError::Io)
    };
    let copied = tokio::select! {
        biased;
        _ = session.until_closed() => Err(FtpError::Transfer("session is shutting down".into())),
        result = transfer => result,
    };
    copied.map(|_| Reply::new(ReplyCode::ClosingDataConnection, "Transfer complete"))
}

fn require_fs(state: &SessionState) -> FtpResult<Arc<dyn ClientFilesystem>> {
    state.fs.clone().ok_or(FtpError::Unauthenticated)
}

async fn data_tls_config(state: &SessionState, driver: &dyn Driver) -> FtpResult<Option<Arc<rustls::ServerConfig>>> {
    if state.data_tls {
        Ok(Some(driver.get_tls_config().await?))
    } else {
        Ok(None)
    }
}

async fn write_interim(writer: &mut WriteHalf<AnyStream>, code: ReplyCode, msg: impl Into<String>) -> FtpResult<()> {
    let reply = Reply::new(code, msg);
    writer.write_all(reply.render().as_bytes()).await.map_err(FtpError::Io)?;
    writer.flush().await.map_err(FtpError::Io)
}
