//! Attribute value codecs.
//!
//! Attributes travel as text. The numeric helpers here mirror the C
//! library conventions the daemon expects: `strtoll`-style base-0
//! integers (decimal, `0x` hex, leading-`0` octal), locale-independent
//! doubles, and `"0"`/`"1"` booleans written with a trailing NUL.
//!
//! Bulk transfer packs every attribute of a scope into one contiguous
//! buffer of `<len:be32><bytes, padded to 4>` records, in context order.
//! A negative record length carries that attribute's read error.

use crate::error::{Error, Result};

/// Upper bound for one bulk transfer buffer.
pub const BULK_BUF_SIZE: usize = 1024 * 1024;

// ── Scalar parsing ───────────────────────────────────────────

/// Parse a base-0 integer: optional sign, then `0x` hex, leading-`0`
/// octal, or decimal. Trailing junk is ignored; consuming no digits or
/// overflowing i64 is an error.
pub fn parse_longlong(s: &str) -> Result<i64> {
    let b = s.trim_start().as_bytes();
    let mut pos = 0;

    let negative = match b.first() {
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

    let radix: u32 = if b[pos..].starts_with(b"0x") || b[pos..].starts_with(b"0X") {
        pos += 2;
        16
    } else if b.get(pos) == Some(&b'0') {
        8
    } else {
        10
    };

    let mut value: i64 = 0;
    let mut digits = 0usize;
    while let Some(d) = b.get(pos).and_then(|&c| (c as char).to_digit(radix)) {
        value = value
            .checked_mul(radix as i64)
            .and_then(|v| {
                if negative {
                    v.checked_sub(d as i64)
                } else {
                    v.checked_add(d as i64)
                }
            })
            .ok_or(Error::InvalidArg)?;
        digits += 1;
        pos += 1;
    }

    if digits == 0 {
        return Err(Error::InvalidArg);
    }
    Ok(value)
}

/// Parse a boolean: any integer, non-zero is true.
pub fn parse_bool(s: &str) -> Result<bool> {
    Ok(parse_longlong(s)? != 0)
}

/// Parse a double from the first whitespace-delimited token.
/// Rust float parsing is locale-independent by construction.
pub fn parse_double(s: &str) -> Result<f64> {
    let token = s.split_whitespace().next().ok_or(Error::InvalidArg)?;
    token.parse::<f64>().map_err(|_| Error::InvalidArg)
}

// ── Scalar formatting ────────────────────────────────────────

pub fn format_bool(v: bool) -> &'static str {
    if v { "1" } else { "0" }
}

pub fn format_longlong(v: i64) -> String {
    format!("{v}")
}

pub fn format_double(v: f64) -> String {
    format!("{v}")
}

// ── Bulk transfer ────────────────────────────────────────────

fn round_up_4(n: usize) -> usize {
    (n + 3) & !3
}

/// Parse a bulk buffer into exactly `count` entries, in order.
///
/// Each entry is the attribute's value bytes, or the error the server
/// recorded for it. A buffer that ends before `count` records is a
/// protocol error.
pub fn parse_bulk(src: &[u8], count: usize) -> Result<Vec<Result<Vec<u8>>>> {
    let mut out = Vec::with_capacity(count);
    let mut pos = 0usize;

    for _ in 0..count {
        if pos + 4 > src.len() {
            return Err(Error::Protocol);
        }
        let len = i32::from_be_bytes([src[pos], src[pos + 1], src[pos + 2], src[pos + 3]]);
        pos += 4;

        if len < 0 {
            out.push(Err(Error::from_wire(len)));
            continue;
        }

        let len = len as usize;
        if pos + len > src.len() {
            return Err(Error::Protocol);
        }
        out.push(Ok(src[pos..pos + len].to_vec()));
        // The final record's padding may be absent.
        pos = (pos + round_up_4(len)).min(src.len());
    }
    Ok(out)
}

/// Build a bulk write buffer. `None` entries are skipped with a zero
/// length record. Values gain a trailing NUL, and each record is padded
/// to a 4-byte multiple.
pub fn build_bulk(entries: &[Option<&[u8]>]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        match entry {
            None => out.extend_from_slice(&0i32.to_be_bytes()),
            Some(val) => {
                let len = val.len() + 1; // trailing NUL included
                out.extend_from_slice(&(len as i32).to_be_bytes());
                out.extend_from_slice(val);
                out.push(0);
                out.resize(out.len() + round_up_4(len) - len, 0);
            }
        }
        if out.len() > BULK_BUF_SIZE {
            return Err(Error::InvalidArg);
        }
    }
    Ok(out)
}

// ── Tests ────────────────────────────────────────────────────
