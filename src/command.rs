//! The command vocabulary and line parsing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A parsed FTP command. The parameter, if any, is kept as the raw
/// string the handler needs to interpret further (a path, a mode
/// letter, a PORT/EPRT address spec, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Quit,
    Auth(String),
    Prot(String),
    Pbsz(String),
    Feat,
    Syst,
    Noop,
    Opts(String),
    Type(String),
    Site(String),
    Stat(Option<String>),
    Size(String),
    Mdtm(String),
    Retr(String),
    Stor(String),
    Appe(String),
    Dele(String),
    Rnfr(String),
    Rnto(String),
    Allo(u64),
    Rest(u64),
    Cwd(String),
    Pwd,
    Cdup,
    List(Option<String>),
    Nlst(Option<String>),
    Mlsd(Option<String>),
    Mlst(Option<String>),
    Mkd(String),
    Rmd(String),
    Pasv,
    Epsv,
    Port(SocketAddr),
    Eprt(SocketAddr),
    /// Recognized token, bad or missing argument.
    BadArgument(&'static str),
    /// Not in the command table at all.
    Unknown,
}

/// Whether a command is permitted before the session has authenticated.
pub fn is_open_to_unauthenticated(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::User(_)
            | Command::Pass(_)
            | Command::Quit
            | Command::Auth(_)
            | Command::Prot(_)
            | Command::Pbsz(_)
            | Command::Feat
            | Command::Syst
            | Command::Noop
            | Command::Opts(_)
    )
}

/// Splits a command line into `(name, parameter)`, uppercasing the name.
/// `parameter` is `""` if the line had none.
fn split_line(line: &str) -> (String, &str) {
    let line = line.trim_end();
    match line.split_once(' ') {
        Some((cmd, rest)) => (cmd.to_ascii_uppercase(), rest.trim_start()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

fn none_if_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Parses `h1,h2,h3,h4,p1,p2` (PORT) into a socket address.
fn parse_port_arg(arg: &str) -> Option<SocketAddr> {
    let parts: Vec<&str> = arg.split(',').collect();
    if parts.len() != 6 {
        return None;
    }
    let nums: Option<Vec<u8>> = parts.iter().map(|p| p.parse::<u8>().ok()).collect();
    let nums = nums?;
    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = (nums[4] as u16) * 256 + nums[5] as u16;
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Parses `|proto|addr|port|` (EPRT), proto ∈ {1, 2}.
fn parse_eprt_arg(arg: &str) -> Option<SocketAddr> {
    let arg = arg.trim();
    let delim = arg.chars().next()?;
    let parts: Vec<&str> = arg.trim_matches(delim).split(delim).collect();
    if parts.len() != 3 {
        return None;
    }
    let port: u16 = parts[2].parse().ok()?;
    let ip: IpAddr = match parts[0] {
        "1" => IpAddr::V4(parts[1].parse::<Ipv4Addr>().ok()?),
        "2" => IpAddr::V6(parts[1].parse::<Ipv6Addr>().ok()?),
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

pub fn parse_command(line: &str) -> Command {
    let (name, arg) = split_line(line);
    match name.as_str() {
        "USER" => Command::User(arg.to_string()),
        "PASS" => Command::Pass(arg.to_string()),
        "QUIT" => Command::Quit,
        "AUTH" => Command::Auth(arg.to_uppercase()),
        "PROT" => Command::Prot(arg.to_uppercase()),
        "PBSZ" => Command::Pbsz(arg.to_string()),
        "FEAT" => Command::Feat,
        "SYST" => Command::Syst,
        "NOOP" => Command::Noop,
        "OPTS" => Command::Opts(arg.to_string()),
        "TYPE" => Command::Type(arg.to_uppercase()),
        "SITE" => Command::Site(arg.to_string()),
        "STAT" => Command::Stat(none_if_empty(arg)),
        "SIZE" => Command::Size(arg.to_string()),
        "MDTM" => Command::Mdtm(arg.to_string()),
        "RETR" => Command::Retr(arg.to_string()),
        "STOR" => Command::Stor(arg.to_string()),
        "APPE" => Command::Appe(arg.to_string()),
        "DELE" => Command::Dele(arg.to_string()),
        "RNFR" => Command::Rnfr(arg.to_string()),
        "RNTO" => Command::Rnto(arg.to_string()),
        "ALLO" => match arg.split_whitespace().next().unwrap_or("").parse::<u64>() {
            Ok(n) => Command::Allo(n),
            Err(_) => Command::BadArgument("ALLO requires a byte count"),
        },
        "REST" => match arg.parse::<u64>() {
            Ok(n) => Command::Rest(n),
            Err(_) => Command::BadArgument("REST requires a byte offset"),
        },
        "CWD" => Command::Cwd(arg.to_string()),
        "PWD" | "XPWD" => Command::Pwd,
        "CDUP" | "XCUP" => Command::Cdup,
        "LIST" => Command::List(none_if_empty(arg)),
        "NLST" => Command::Nlst(none_if_empty(arg)),
        "MLSD" => Command::Mlsd(none_if_empty(arg)),
        "MLST" => Command::Mlst(none_if_empty(arg)),
        "MKD" | "XMKD" => Command::Mkd(arg.to_string()),
        "RMD" | "XRMD" => Command::Rmd(arg.to_string()),
        "PASV" => Command::Pasv,
        "EPSV" => Command::Epsv,
        "PORT" => match parse_port_arg(arg) {
            Some(addr) => Command::Port(addr),
            None => Command::BadArgument("malformed PORT address"),
        },
        "EPRT" => match parse_eprt_arg(arg) {
            Some(addr) => Command::Eprt(addr),
            None => Command::BadArgument("malformed EPRT address"),
        },
        "" => Command::Unknown,
        _ => Command::Unknown,
    }
}
