//! Legacy CRLF text framing.
//!
//! Requests are ASCII command lines terminated by `\r\n`. Responses
//! begin with a signed decimal integer on its own line; a negative value
//! is a negated POSIX error, a positive value is either a result or a
//! payload length (payload bytes follow, then one `\n` the client
//! discards). Stray empty lines before the integer are tolerated.
//!
//! This module is pure: command builders produce strings, the integer
//! parser consumes a captured line. Wire traffic lives in the client.

use crate::error::{Error, Result};

/// Attribute scope selector as spelled on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrScope<'a> {
    Device,
    Debug,
    Buffer,
    /// `output` picks the `OUTPUT`/`INPUT` keyword.
    Channel { output: bool, id: &'a str },
}

impl AttrScope<'_> {
    fn spell(&self, out: &mut String) {
        match self {
            AttrScope::Device => {}
            AttrScope::Debug => out.push_str(" DEBUG"),
            AttrScope::Buffer => out.push_str(" BUFFER"),
            AttrScope::Channel { output, id } => {
                out.push_str(if *output { " OUTPUT " } else { " INPUT " });
                out.push_str(id);
            }
        }
    }
}

// ── Command builders ─────────────────────────────────────────

pub fn version() -> String {
    "VERSION\r\n".to_owned()
}

pub fn print(compressed: bool) -> String {
    if compressed {
        "ZPRINT\r\n".to_owned()
    } else {
        "PRINT\r\n".to_owned()
    }
}

pub fn timeout(ms: u32) -> String {
    format!("TIMEOUT {ms}\r\n")
}

pub fn open(dev_id: &str, nb_samples: usize, mask_text: &str, cyclic: bool) -> String {
    if cyclic {
        format!("OPEN {dev_id} {nb_samples} {mask_text} CYCLIC\r\n")
    } else {
        format!("OPEN {dev_id} {nb_samples} {mask_text}\r\n")
    }
}

pub fn close(dev_id: &str) -> String {
    format!("CLOSE {dev_id}\r\n")
}

pub fn read_attr(dev_id: &str, scope: AttrScope<'_>, attr: Option<&str>) -> String {
    let mut out = format!("READ {dev_id}");
    scope.spell(&mut out);
    if let Some(attr) = attr {
        out.push(' ');
        out.push_str(attr);
    }
    out.push_str("\r\n");
    out
}

pub fn write_attr(dev_id: &str, scope: AttrScope<'_>, attr: Option<&str>, len: usize) -> String {
    let mut out = format!("WRITE {dev_id}");
    scope.spell(&mut out);
    if let Some(attr) = attr {
        out.push(' ');
        out.push_str(attr);
    }
    out.push_str(&format!(" {len}\r\n"));
    out
}

pub fn get_trigger(dev_id: &str) -> String {
    format!("GETTRIG {dev_id}\r\n")
}

pub fn set_trigger(dev_id: &str, trigger_id: Option<&str>) -> String {
    match trigger_id {
        Some(t) => format!("SETTRIG {dev_id} {t}\r\n"),
        None => format!("SETTRIG {dev_id}\r\n"),
    }
}

pub fn set_buffers_count(dev_id: &str, count: u32) -> String {
    format!("SET {dev_id} BUFFERS_COUNT {count}\r\n")
}

pub fn read_buf(dev_id: &str, nb_bytes: usize) -> String {
    format!("READBUF {dev_id} {nb_bytes}\r\n")
}

pub fn write_buf(dev_id: &str, nb_bytes: usize) -> String {
    format!("WRITEBUF {dev_id} {nb_bytes}\r\n")
}

pub fn exit() -> String {
    "EXIT\r\n".to_owned()
}

// ── Response integer lines ───────────────────────────────────

/// Parse the integer heading a legacy response.
///
/// Leading `\n` bytes are skipped (servers occasionally emit stray
/// blank lines), base 10 only, overflow rejected, and at least one
/// digit must be consumed. Anything after the digits is ignored.
pub fn parse_integer(line: &[u8]) -> Result<i64> {
    let mut pos = 0usize;
    while line.get(pos) == Some(&b'\n') {
        pos += 1;
    }

    let negative = match line.get(pos) {
        Some(b'-') => {
            pos += 1;
            true
        }
        Some(b'+') => {
            pos += 1;
            false
        }
        _ => false,
    };

    let mut value: i64 = 0;
    let mut digits = 0usize;
    while let Some(&c) = line.get(pos) {
        if !c.is_ascii_digit() {
            break;
        }
        let d = (c - b'0') as i64;
        value = value
            .checked_mul(10)
            .and_then(|v| if negative { v.checked_sub(d) } else { v.checked_add(d) })
            .ok_or(Error::InvalidArg)?;
        digits += 1;
        pos += 1;
    }

    if digits == 0 {
        return Err(Error::InvalidArg);
    }
    Ok(value)
}

/// Split a legacy `VERSION` response line: `major minor git-tag`.
pub fn parse_version(line: &str) -> Result<(u32, u32, String)> {
    let mut it = line.split_whitespace();
    let major = it.next().and_then(|t| t.parse().ok());
    let minor = it.next().and_then(|t| t.parse().ok());
    let git = it.next().unwrap_or("").to_owned();
    match (major, minor) {
        (Some(major), Some(minor)) => Ok((major, minor, git)),
        _ => Err(Error::Protocol),
    }
}

// ── Tests ────────────────────────────────────────────────────
