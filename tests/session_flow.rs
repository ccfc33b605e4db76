//! End-to-end control/data-connection scenarios driven against a real
//! [`rftpd::Server`] bound to an in-memory filesystem test double.

use async_trait::async_trait;
use chrono::Utc;
use rftpd::{ClientContext, ClientFilesystem, Driver, FileInfo, FileStream, FtpError, FtpResult, OpenFlags, Server, Settings};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeek, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;

type FileTable = Arc<Mutex<HashMap<String, Vec<u8>>>>;

struct MemFs {
    files: FileTable,
    dirs: Mutex<HashSet<String>>,
}

impl MemFs {
    fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert("/".to_string());
        MemFs {
            files: Arc::new(Mutex::new(HashMap::new())),
            dirs: Mutex::new(dirs),
        }
    }
}

/// A file backed by an in-memory buffer. Writes only become visible to
/// the rest of the filesystem on shutdown, mirroring a real file's
/// writes only being durable once closed.
struct MemFile {
    cursor: Cursor<Vec<u8>>,
    path: String,
    store: FileTable,
    writable: bool,
}

impl AsyncRead for MemFile {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let n = std::io::Read::read(&mut self.cursor, buf.initialize_unfilled())?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MemFile {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
        Poll::Ready(std::io::Write::write(&mut self.cursor, data))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.writable {
            this.store.lock().unwrap().insert(this.path.clone(), this.cursor.get_ref().clone());
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemFile {
    fn start_seek(mut self: Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        std::io::Seek::seek(&mut self.cursor, position)?;
        Ok(())
    }
    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.cursor.position()))
    }
}

#[async_trait]
impl ClientFilesystem for MemFs {
    async fn open_file(&self, _ctx: &ClientContext, path: &str, flags: OpenFlags) -> FtpResult<Box<dyn FileStream>> {
        let existing = self.files.lock().unwrap().get(path).cloned();
        if !flags.write && existing.is_none() {
            return Err(FtpError::driver_msg(format!("{path}: not found")));
        }

        let mut cursor = Cursor::new(existing.unwrap_or_default());
        if flags.write && !flags.append {
            cursor = Cursor::new(Vec::new());
        } else if flags.append {
            cursor.set_position(cursor.get_ref().len() as u64);
        }

        Ok(Box::new(MemFile {
            cursor,
            path: path.to_string(),
            store: self.files.clone(),
            writable: flags.write,
        }))
    }

    async fn get_file_info(&self, _ctx: &ClientContext, path: &str) -> FtpResult<FileInfo> {
        if self.dirs.lock().unwrap().contains(path) {
            return Ok(FileInfo {
                name: base_name(path),
                size: 0,
                mode: "rwxr-xr-x".to_string(),
                modified: Utc::now(),
                is_dir: true,
            });
        }
        let files = self.files.lock().unwrap();
        let data = files.get(path).ok_or_else(|| FtpError::driver_msg(format!("{path}: not found")))?;
        Ok(FileInfo {
            name: base_name(path),
            size: data.len() as u64,
            mode: "rw-r--r--".to_string(),
            modified: Utc::now(),
            is_dir: false,
        })
    }

    async fn list_files(&self, _ctx: &ClientContext, path: &str) -> FtpResult<Vec<FileInfo>> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{path}/") };
        let mut out = Vec::new();
        for dir in self.dirs.lock().unwrap().iter() {
            if dir != "/" && dir.starts_with(&prefix) && !dir[prefix.len()..].contains('/') {
                out.push(FileInfo {
                    name: base_name(dir),
                    size: 0,
                    mode: "rwxr-xr-x".to_string(),
                    modified: Utc::now(),
                    is_dir: true,
                });
            }
        }
        for (name, data) in self.files.lock().unwrap().iter() {
            if name.starts_with(&prefix) && !name[prefix.len()..].contains('/') {
                out.push(FileInfo {
                    name: base_name(name),
                    size: data.len() as u64,
                    mode: "rw-r--r--".to_string(),
                    modified: Utc::now(),
                    is_dir: false,
                });
            }
        }
        Ok(out)
    }

    async fn make_directory(&self, _ctx: &ClientContext, path: &str) -> FtpResult<()> {
        self.dirs.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    async fn delete_file(&self, _ctx: &ClientContext, path: &str) -> FtpResult<()> {
        if self.dirs.lock().unwrap().remove(path) {
            return Ok(());
        }
        if self.files.lock().unwrap().remove(path).is_some() {
            Ok(())
        } else {
            Err(FtpError::driver_msg(format!("{path}: not found")))
        }
    }

    async fn rename_file(&self, _ctx: &ClientContext, from: &str, to: &str) -> FtpResult<()> {
        let mut files = self.files.lock().unwrap();
        if let Some(data) = files.remove(from) {
            files.insert(to.to_string(), data);
            return Ok(());
        }
        drop(files);
        let mut dirs = self.dirs.lock().unwrap();
        if dirs.remove(from) {
            dirs.insert(to.to_string());
            Ok(())
        } else {
            Err(FtpError::driver_msg(format!("{from}: not found")))
        }
    }

    async fn chmod_file(&self, _ctx: &ClientContext, _path: &str, _mode: u32) -> FtpResult<()> {
        Ok(())
    }

    async fn can_allocate(&self, _ctx: &ClientContext, _size: u64) -> FtpResult<bool> {
        Ok(true)
    }

    async fn change_directory(&self, _ctx: &ClientContext, path: &str) -> FtpResult<()> {
        if self.dirs.lock().unwrap().contains(path) {
            Ok(())
        } else {
            Err(FtpError::driver_msg(format!("{path}: no such directory")))
        }
    }
}

fn base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

struct TestDriver {
    fs: Arc<MemFs>,
    listen_addr: String,
}

#[async_trait]
impl Driver for TestDriver {
    async fn get_settings(&self) -> FtpResult<Settings> {
        Ok(Settings {
            listen_addr: self.listen_addr.clone(),
            ..Settings::default()
        })
    }

    async fn get_tls_config(&self) -> FtpResult<Arc<rustls::ServerConfig>> {
        Err(FtpError::Tls("TLS not configured in tests".into()))
    }

    async fn welcome_user(&self, _ctx: &ClientContext) -> FtpResult<String> {
        Ok("test server ready".to_string())
    }

    async fn auth_user(&self, _ctx: &ClientContext, user: &str, pass: &str) -> FtpResult<Arc<dyn ClientFilesystem>> {
        if user == "alice" && pass == "secret" {
            Ok(self.fs.clone())
        } else {
            Err(FtpError::Unauthenticated)
        }
    }

    async fn user_left(&self, _ctx: &ClientContext) {}
}

/// Binds a fresh test server on an ephemeral port and returns its address
/// alongside the running `Server` handle (kept alive so `stop()` can be
/// called later).
async fn spawn_server() -> (Server, SocketAddr) {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let driver = Arc::new(TestDriver {
        fs: Arc::new(MemFs::new()),
        listen_addr: addr.to_string(),
    });
    let server = Server::new(driver);
    let spawned = server.clone();
    tokio::spawn(async move {
        let _ = spawned.listen().await;
    });
    // Give the accept loop a moment to bind before the test connects.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    (server, addr)
}

async fn read_reply(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
    let mut out = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap();
        if n == 0 {
            break;
        }
        let is_final = line.len() > 3 && line.as_bytes()[3] == b' ';
        out.push_str(&line);
        if is_final {
            break;
        }
    }
    out
}

async fn connect(addr: SocketAddr) -> (BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let greeting = read_reply(&mut reader).await;
    assert!(greeting.starts_with("220"), "unexpected greeting: {greeting}");
    (reader, write_half)
}

async fn send(writer: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) {
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\r\n").await.unwrap();
    writer.flush().await.unwrap();
}

async fn login(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>, writer: &mut tokio::net::tcp::OwnedWriteHalf) {
    send(writer, "USER alice").await;
    assert!(read_reply(reader).await.starts_with("331"));
    send(writer, "PASS secret").await;
    assert!(read_reply(reader).await.starts_with("230"));
}

/// Parses a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply into the
/// data connection's address.
fn parse_pasv(reply: &str) -> SocketAddr {
    let start = reply.find('(').unwrap();
    let end = reply.find(')').unwrap();
    let nums: Vec<u16> = reply[start + 1..end].split(',').map(|n| n.trim().parse().unwrap()).collect();
    let ip = std::net::Ipv4Addr::new(nums[0] as u8, nums[1] as u8, nums[2] as u8, nums[3] as u8);
    let port = nums[4] * 256 + nums[5];
    SocketAddr::new(ip.into(), port)
}

#[tokio::test]
async fn anonymous_probing_is_rejected_then_quit_succeeds() {
    let (_server, addr) = spawn_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    send(&mut writer, "PWD").await;
    assert!(read_reply(&mut reader).await.starts_with("530"));

    send(&mut writer, "QUIT").await;
    assert!(read_reply(&mut reader).await.starts_with("221"));
}

#[tokio::test]
async fn login_then_pwd_reports_root() {
    let (_server, addr) = spawn_server().await;
    let (mut reader, mut writer) = connect(addr).await;
    login(&mut reader, &mut writer).await;

    send(&mut writer, "PWD").await;
    let reply = read_reply(&mut reader).await;
    assert!(reply.starts_with("257"));
    assert!(reply.contains("\"/\""));
}

#[tokio::test]
async fn mkd_then_list_shows_new_directory() {
    let (_server, addr) = spawn_server().await;
    let (mut reader, mut writer) = connect(addr).await;
    login(&mut reader, &mut writer).await;

    send(&mut writer, "MKD uploads").await;
    assert!(read_reply(&mut reader).await.starts_with("257"));

    send(&mut writer, "PASV").await;
    let pasv_reply = read_reply(&mut reader).await;
    assert!(pasv_reply.starts_with("227"));
    let data_addr = parse_pasv(&pasv_reply);

    send(&mut writer, "LIST").await;
    assert!(read_reply(&mut reader).await.starts_with("150"));
    let mut data = TcpStream::connect(data_addr).await.unwrap();
    let mut body = Vec::new();
    data.read_to_end(&mut body).await.unwrap();
    assert!(read_reply(&mut reader).await.starts_with("226"));

    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("uploads"));
}

#[tokio::test]
async fn upload_then_download_round_trips() {
    let (_server, addr) = spawn_server().await;
    let (mut reader, mut writer) = connect(addr).await;
    login(&mut reader, &mut writer).await;

    send(&mut writer, "PASV").await;
    let data_addr = parse_pasv(&read_reply(&mut reader).await);
    send(&mut writer, "STOR greeting.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("150"));
    {
        let mut data = TcpStream::connect(data_addr).await.unwrap();
        data.write_all(b"hello from the test client").await.unwrap();
        data.shutdown().await.unwrap();
    }
    assert!(read_reply(&mut reader).await.starts_with("226"));

    send(&mut writer, "PASV").await;
    let data_addr = parse_pasv(&read_reply(&mut reader).await);
    send(&mut writer, "RETR greeting.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("150"));
    let mut data = TcpStream::connect(data_addr).await.unwrap();
    let mut body = Vec::new();
    data.read_to_end(&mut body).await.unwrap();
    assert!(read_reply(&mut reader).await.starts_with("226"));

    assert_eq!(body, b"hello from the test client");
}

#[tokio::test]
async fn rest_resumes_download_from_offset() {
    let (_server, addr) = spawn_server().await;
    let (mut reader, mut writer) = connect(addr).await;
    login(&mut reader, &mut writer).await;

    send(&mut writer, "PASV").await;
    let data_addr = parse_pasv(&read_reply(&mut reader).await);
    send(&mut writer, "STOR numbers.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("150"));
    {
        let mut data = TcpStream::connect(data_addr).await.unwrap();
        data.write_all(b"0123456789").await.unwrap();
        data.shutdown().await.unwrap();
    }
    assert!(read_reply(&mut reader).await.starts_with("226"));

    send(&mut writer, "REST 5").await;
    assert!(read_reply(&mut reader).await.starts_with("350"));

    send(&mut writer, "PASV").await;
    let data_addr = parse_pasv(&read_reply(&mut reader).await);
    send(&mut writer, "RETR numbers.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("150"));
    let mut data = TcpStream::connect(data_addr).await.unwrap();
    let mut body = Vec::new();
    data.read_to_end(&mut body).await.unwrap();
    assert!(read_reply(&mut reader).await.starts_with("226"));

    assert_eq!(body, b"56789");
}

#[tokio::test]
async fn rename_moves_a_file() {
    let (_server, addr) = spawn_server().await;
    let (mut reader, mut writer) = connect(addr).await;
    login(&mut reader, &mut writer).await;

    send(&mut writer, "PASV").await;
    let data_addr = parse_pasv(&read_reply(&mut reader).await);
    send(&mut writer, "STOR old.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("150"));
    {
        let mut data = TcpStream::connect(data_addr).await.unwrap();
        data.write_all(b"payload").await.unwrap();
        data.shutdown().await.unwrap();
    }
    assert!(read_reply(&mut reader).await.starts_with("226"));

    send(&mut writer, "RNFR old.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("350"));
    send(&mut writer, "RNTO new.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("250"));

    send(&mut writer, "SIZE new.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("213"));

    send(&mut writer, "SIZE old.txt").await;
    let reply = read_reply(&mut reader).await;
    assert!(reply.starts_with("550"), "unexpected reply: {reply}");
}

#[tokio::test]
async fn stop_aborts_an_in_flight_transfer() {
    let (server, addr) = spawn_server().await;
    let (mut reader, mut writer) = connect(addr).await;
    login(&mut reader, &mut writer).await;

    send(&mut writer, "PASV").await;
    let data_addr = parse_pasv(&read_reply(&mut reader).await);
    send(&mut writer, "STOR stuck.txt").await;
    assert!(read_reply(&mut reader).await.starts_with("150"));

    // Open the data connection and send a few bytes without EOF, so the
    // server's copy loop would otherwise block forever waiting for more.
    let mut data = TcpStream::connect(data_addr).await.unwrap();
    data.write_all(b"partial").await.unwrap();

    assert_eq!(server.active_session_count(), 1);
    tokio::time::timeout(std::time::Duration::from_secs(5), server.stop())
        .await
        .expect("stop() did not return within bounded time while a transfer was in flight");

    drop(data);
}

#[tokio::test]
async fn stop_closes_idle_control_connections() {
    let (server, addr) = spawn_server().await;
    let (mut reader, mut writer) = connect(addr).await;
    login(&mut reader, &mut writer).await;

    assert_eq!(server.active_session_count(), 1);
    server.stop().await;

    // The control connection should observe EOF shortly after the server
    // notifies every registered session to wind down.
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(std::time::Duration::from_secs(2), reader.read(&mut buf))
        .await
        .expect("server did not close the connection after stop()")
        .unwrap();
    assert_eq!(n, 0);
    let _ = writer.write_all(b"NOOP\r\n").await;
}
