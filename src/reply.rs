//! FTP reply codes (RFC 959 §4.2) and the `Reply` type sent back on the
//! control connection.

use std::fmt;

/// The three-digit reply codes this server ever sends. Exhaustive:
/// anything not listed here is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    DataConnectionOpen = 150,
    CommandOk = 200,
    CommandNotImplementedSuperfluous = 202,
    SystemStatus = 211,
    FileStatus = 213,
    SystemType = 215,
    ServiceReady = 220,
    ClosingControlConnection = 221,
    ClosingDataConnection = 226,
    EnteringPassiveMode = 227,
    EnteringExtendedPassiveMode = 229,
    UserLoggedIn = 230,
    AuthOk = 234,
    FileActionOk = 250,
    PathCreated = 257,
    NeedPassword = 331,
    FileActionPending = 350,
    ServiceNotAvailable = 421,
    TransientFileError = 450,
    SyntaxError = 500,
    ParameterSyntaxError = 501,
    NotImplemented = 502,
    NotLoggedIn = 530,
    FileError = 550,
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u32)
    }
}

/// A reply to be written on the control connection. Supports the
/// single-line form (`<code> <message>\r\n`) and the RFC 959 multi-line
/// continuation form (`<code>-line1\r\n...\r\n<code> last\r\n`).
#[derive(Debug, Clone)]
pub struct Reply {
    code: ReplyCode,
    lines: Vec<String>,
}

impl Reply {
    pub fn new(code: ReplyCode, message: impl Into<String>) -> Self {
        Reply {
            code,
            lines: vec![message.into()],
        }
    }

    /// A multi-line reply: all lines but the last are continuation lines.
    pub fn multiline(code: ReplyCode, lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let lines = lines.into_iter().map(Into::into).collect::<Vec<_>>();
        debug_assert!(!lines.is_empty(), "a reply must have at least one line");
        Reply { code, lines }
    }

    pub fn code(&self) -> ReplyCode {
        self.code
    }

    /// Renders the reply as the exact bytes that go out on the wire,
    /// including the trailing `\r\n` of every line.
    pub fn render(&self) -> String {
        let code = self.code as u32;
        let mut out = String::new();
        let (body, last) = self.lines.split_at(self.lines.len() - 1);
        for line in body {
            out.push_str(&format!("{code}-{line}\r\n"));
        }
        out.push_str(&format!("{code} {}\r\n", last[0]));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_renders_with_space() {
        let r = Reply::new(ReplyCode::UserLoggedIn, "User logged in, proceed");
        assert_eq!(r.render(), "230 User logged in, proceed\r\n");
    }

    #[test]
    fn multiline_uses_dash_then_space() {
        let r = Reply::multiline(ReplyCode::FileStatus, ["File details", "more"]);
        assert_eq!(r.render(), "213-File details\r\n213 more\r\n");
    }
}
