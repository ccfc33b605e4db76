//! Directory listing rendering.

use crate::driver::FileInfo;
use chrono::{DateTime, Utc};

const OLD_THRESHOLD_DAYS: i64 = 180;

/// Renders one `LIST`/`NLST`-style `ls -l` line, terminated by `\r\n`.
pub fn unix_list_line(info: &FileInfo, now: DateTime<Utc>) -> String {
    let kind = if info.is_dir { 'd' } else { '-' };
    format!(
        "{kind}{} 1 ftp ftp {:>12} {} {}\r\n",
        info.mode,
        info.size,
        format_list_date(info.modified, now),
        info.name
    )
}

fn format_list_date(modified: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age_days = (now - modified).num_days();
    if age_days > OLD_THRESHOLD_DAYS {
        modified.format("%b %e  %Y").to_string()
    } else {
        modified.format("%b %e %H:%M").to_string()
    }
}

/// Renders a complete `LIST`/`NLST` stream body, including the
/// terminating empty line specified in §4.6.
pub fn render_list(entries: &[FileInfo], now: DateTime<Utc>) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&unix_list_line(entry, now));
    }
    out.push_str("\r\n");
    out
}

/// Renders a complete `NLST` stream body: bare names, one per line.
pub fn render_nlst(entries: &[FileInfo]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.name);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Renders one `MLSD`/`MLST` machine-readable fact line (no trailing
/// `\r\n` — callers add framing as their command requires).
pub fn mlsx_fact_line(info: &FileInfo) -> String {
    let kind = if info.is_dir { "dir" } else { "file" };
    format!(
        "Type={kind};Size={};Modify={}; {}",
        info.size,
        info.modified.format("%Y%m%d%H%M%S"),
        info.name
    )
}

pub fn render_mlsd(entries: &[FileInfo]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&mlsx_fact_line(entry));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info(name: &str, is_dir: bool) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: 42,
            mode: "rw-r--r--".to_string(),
            modified: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
            is_dir,
        }
    }

    #[test]
    fn recent_file_uses_time_format() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let line = unix_list_line(&info("f.txt", false), now);
        assert!(line.starts_with("-rw-r--r-- 1 ftp ftp           42 Jan  1 12:00 f.txt\r\n"));
    }

    #[test]
    fn old_file_uses_year_format() {
        let now = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        let line = unix_list_line(&info("f.txt", false), now);
        assert!(line.contains("Jan  1  2026"));
    }

    #[test]
    fn mlsd_has_trailing_blank_line() {
        let out = render_mlsd(&[info("d", true)]);
        assert!(out.ends_with("\r\n\r\n"));
        assert!(out.contains("Type=dir;Size=42;Modify=20260101120000; d"));
    }

    #[test]
    fn nlst_is_bare_names() {
        let out = render_nlst(&[info("a", false), info("b", true)]);
        assert_eq!(out, "a\r\nb\r\n\r\n");
    }
}
