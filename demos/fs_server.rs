//! A local-filesystem-backed `Driver`/`ClientFilesystem` for rftpd.
//!
//! `cargo run --example rftpd-fs-demo -- --folder ./public --host 0.0.0.0 --port 2121`

use async_trait::async_trait;
use clap::Parser;
use rftpd::{ClientContext, ClientFilesystem, Driver, FileInfo, FileStream, FtpError, FtpResult, OpenFlags, Server, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Folder to serve as the FTP root
    #[arg(long, default_value_t = String::from("./"))]
    folder: String,

    /// Listening host
    #[arg(long, default_value_t = String::from("127.0.0.1"))]
    host: String,

    /// Listening port
    #[arg(long, default_value_t = 2121)]
    port: u16,
}

struct FsDriver {
    root: PathBuf,
    listen_addr: String,
}

#[async_trait]
impl Driver for FsDriver {
    async fn get_settings(&self) -> FtpResult<Settings> {
        Ok(Settings {
            listen_addr: self.listen_addr.clone(),
            ..Settings::default()
        })
    }

    async fn get_tls_config(&self) -> FtpResult<Arc<rustls::ServerConfig>> {
        Err(FtpError::Tls("this demo does not configure TLS; omit AUTH TLS".into()))
    }

    async fn welcome_user(&self, _ctx: &ClientContext) -> FtpResult<String> {
        Ok(format!("rftpd serving {}", self.root.display()))
    }

    async fn auth_user(&self, _ctx: &ClientContext, user: &str, _pass: &str) -> FtpResult<Arc<dyn ClientFilesystem>> {
        tracing::info!(user, "login");
        Ok(Arc::new(FsFilesystem { root: self.root.clone() }))
    }

    async fn user_left(&self, ctx: &ClientContext) {
        tracing::info!(session = ctx.id(), "user left");
    }
}

/// Joins a virtual, `/`-rooted path under `root`, stripping the leading
/// slash so `Path::join` doesn't treat it as absolute.
fn joined(root: &Path, virtual_path: &str) -> PathBuf {
    root.join(virtual_path.trim_start_matches('/'))
}

/// Verifies `candidate` resolves (after canonicalization of its existing
/// prefix) inside `root`, extended to cover a target that doesn't exist
/// yet (a `STOR`/`MKD` destination) by canonicalizing the nearest
/// existing ancestor instead of the target itself.
async fn contained(root: &Path, candidate: &Path) -> FtpResult<PathBuf> {
    let root = fs::canonicalize(root).await.map_err(FtpError::driver)?;

    let mut probe = candidate.to_path_buf();
    let mut tail = Vec::new();
    loop {
        match fs::canonicalize(&probe).await {
            Ok(real) => {
                let mut real = real;
                for part in tail.into_iter().rev() {
                    real.push(part);
                }
                if !real.starts_with(&root) {
                    return Err(FtpError::driver_msg("path escapes the served root"));
                }
                return Ok(real);
            }
            Err(_) => {
                let Some(name) = probe.file_name().map(|n| n.to_owned()) else {
                    return Err(FtpError::driver_msg("invalid path"));
                };
                tail.push(name);
                if !probe.pop() {
                    return Err(FtpError::driver_msg("invalid path"));
                }
            }
        }
    }
}

fn file_info(name: String, metadata: &std::fs::Metadata) -> FtpResult<FileInfo> {
    use std::os::unix::fs::PermissionsExt;
    let modified = metadata.modified().map_err(FtpError::driver)?;
    let secs = modified.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let modified = chrono::DateTime::from_timestamp(secs as i64, 0).unwrap_or_default();
    let mode = metadata.permissions().mode();
    Ok(FileInfo {
        name,
        size: metadata.len(),
        mode: unix_mode_string(mode),
        modified,
        is_dir: metadata.is_dir(),
    })
}

fn unix_mode_string(mode: u32) -> String {
    let bits = [
        (0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
        (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
        (0o004, 'r'), (0o002, 'w'), (0o001, 'x'),
    ];
    bits.iter().map(|(bit, ch)| if mode & bit != 0 { *ch } else { '-' }).collect()
}

struct FsFilesystem {
    root: PathBuf,
}

#[async_trait]
impl ClientFilesystem for FsFilesystem {
    async fn open_file(&self, _ctx: &ClientContext, path: &str, flags: OpenFlags) -> FtpResult<Box<dyn FileStream>> {
        let real = contained(&self.root, &joined(&self.root, path)).await?;
        let file = fs::OpenOptions::new()
            .read(!flags.write)
            .write(flags.write)
            .append(flags.append)
            .create(flags.write)
            .truncate(flags.write && !flags.append)
            .open(&real)
            .await
            .map_err(FtpError::driver)?;
        Ok(Box::new(file))
    }

    async fn get_file_info(&self, _ctx: &ClientContext, path: &str) -> FtpResult<FileInfo> {
        let real = contained(&self.root, &joined(&self.root, path)).await?;
        let metadata = fs::metadata(&real).await.map_err(FtpError::driver)?;
        let name = real.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        file_info(name, &metadata)
    }

    async fn list_files(&self, _ctx: &ClientContext, path: &str) -> FtpResult<Vec<FileInfo>> {
        let real = contained(&self.root, &joined(&self.root, path)).await?;
        let metadata = fs::metadata(&real).await.map_err(FtpError::driver)?;
        if !metadata.is_dir() {
            let name = real.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            return Ok(vec![file_info(name, &metadata)?]);
        }

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&real).await.map_err(FtpError::driver)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(FtpError::driver)? {
            let metadata = entry.metadata().await.map_err(FtpError::driver)?;
            entries.push(file_info(entry.file_name().to_string_lossy().into_owned(), &metadata)?);
        }
        Ok(entries)
    }

    async fn make_directory(&self, _ctx: &ClientContext, path: &str) -> FtpResult<()> {
        let target = joined(&self.root, path);
        contained(&self.root, &target).await?;
        fs::create_dir(&target).await.map_err(FtpError::driver)
    }

    async fn delete_file(&self, _ctx: &ClientContext, path: &str) -> FtpResult<()> {
        let real = contained(&self.root, &joined(&self.root, path)).await?;
        let metadata = fs::metadata(&real).await.map_err(FtpError::driver)?;
        if metadata.is_dir() {
            fs::remove_dir(&real).await.map_err(FtpError::driver)
        } else {
            fs::remove_file(&real).await.map_err(FtpError::driver)
        }
    }

    async fn rename_file(&self, _ctx: &ClientContext, from: &str, to: &str) -> FtpResult<()> {
        let real_from = contained(&self.root, &joined(&self.root, from)).await?;
        let target_to = joined(&self.root, to);
        contained(&self.root, &target_to).await?;
        fs::rename(&real_from, &target_to).await.map_err(FtpError::driver)
    }

    async fn chmod_file(&self, _ctx: &ClientContext, path: &str, mode: u32) -> FtpResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let real = contained(&self.root, &joined(&self.root, path)).await?;
        fs::set_permissions(&real, std::fs::Permissions::from_mode(mode)).await.map_err(FtpError::driver)
    }

    async fn can_allocate(&self, _ctx: &ClientContext, _size: u64) -> FtpResult<bool> {
        Ok(true)
    }

    async fn change_directory(&self, _ctx: &ClientContext, path: &str) -> FtpResult<()> {
        let real = contained(&self.root, &joined(&self.root, path)).await?;
        let metadata = fs::metadata(&real).await.map_err(FtpError::driver)?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(FtpError::driver_msg("not a directory"))
        }
    }
}

#[tokio::main]
async fn main() -> FtpResult<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let root = std::fs::canonicalize(&args.folder).map_err(FtpError::Io)?;
    tracing::info!(root = %root.display(), "serving");

    let driver = FsDriver {
        root,
        listen_addr: format!("{}:{}", args.host, args.port),
    };

    let server = Server::new(Arc::new(driver));
    server.listen().await
}
