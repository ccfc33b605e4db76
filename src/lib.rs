//! An embeddable FTP server: a control-session state machine, data-channel
//! negotiation (active and passive, IPv4 and IPv6), and TLS upgrade for
//! both the control and data connections.
//!
//! The library supplies none of the authentication, storage, or TLS
//! material itself — a host program implements [`Driver`] and
//! [`ClientFilesystem`] and hands them to a [`Server`].

pub mod command;
pub mod context;
pub mod driver;
pub mod error;
pub mod reply;
mod server;
mod session;
pub mod settings;
pub mod tls;
pub mod transfer;

pub use context::ClientContext;
pub use driver::{ClientFilesystem, Driver, FileInfo, FileStream, OpenFlags};
pub use error::{FtpError, FtpResult};
pub use reply::{Reply, ReplyCode};
pub use server::Server;
pub use settings::Settings;
