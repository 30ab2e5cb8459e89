//! Unified error type for the IIOD client runtime.
//!
//! A single `Error` enum that every subsystem converts into, keeping the
//! caller-facing API uniform. The IIOD wire carries errors as negated
//! POSIX codes, so every variant maps to an errno and back; codes that
//! have no named variant round-trip through [`Error::Os`].

use core::fmt;
use std::io;

// ---------------------------------------------------------------------------
// Crate-wide error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed command, undersized buffer, mask word count mismatch.
    InvalidArg,
    /// Device id does not exist in this context.
    NotFound,
    /// Attribute absent on this object.
    NoEntry,
    /// Buffer already enabled, or block re-enqueued while in flight.
    Busy,
    /// Operation on a disabled buffer or a closed handle.
    BadFd,
    /// Transport reached end-of-stream.
    BrokenPipe,
    /// Deadline expired before any progress.
    TimedOut,
    /// Cancellation observed mid-operation.
    Cancelled,
    /// Truncated or malformed bulk-attribute stream.
    Protocol,
    /// Opcode unknown to the peer, or command not implemented.
    NotSupported,
    /// Allocation refused by the peer.
    NoMem,
    /// Payload larger than the caller's buffer, or a low-level I/O
    /// fault with no better classification.
    Io,
    /// Any other errno received from the wire (stored positive).
    Os(i32),
}

// Linux errno values; the wire protocol is Linux-defined so these are
// fixed regardless of the host.
const ENOENT: i32 = 2;
const EINTR: i32 = 4;
const EIO: i32 = 5;
const EBADF: i32 = 9;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const EPIPE: i32 = 32;
const ENOSYS: i32 = 38;
const EPROTO: i32 = 71;
const ETIMEDOUT: i32 = 110;

impl Error {
    /// Positive errno for this error.
    pub fn errno(self) -> i32 {
        match self {
            Self::InvalidArg => EINVAL,
            Self::NotFound => ENODEV,
            Self::NoEntry => ENOENT,
            Self::Busy => EBUSY,
            Self::BadFd => EBADF,
            Self::BrokenPipe => EPIPE,
            Self::TimedOut => ETIMEDOUT,
            Self::Cancelled => EINTR,
            Self::Protocol => EPROTO,
            Self::NotSupported => ENOSYS,
            Self::NoMem => ENOMEM,
            Self::Io => EIO,
            Self::Os(n) => n.max(1),
        }
    }

    /// Negated errno as carried in a response `code` field.
    pub fn wire_code(self) -> i32 {
        -self.errno()
    }

    /// Map a positive errno back to a variant.
    pub fn from_errno(errno: i32) -> Self {
        match errno.max(1) {
            EINVAL => Self::InvalidArg,
            ENODEV => Self::NotFound,
            ENOENT => Self::NoEntry,
            EBUSY => Self::Busy,
            EBADF => Self::BadFd,
            EPIPE => Self::BrokenPipe,
            ETIMEDOUT => Self::TimedOut,
            EINTR => Self::Cancelled,
            EPROTO => Self::Protocol,
            ENOSYS => Self::NotSupported,
            ENOMEM => Self::NoMem,
            EIO => Self::Io,
            n => Self::Os(n),
        }
    }

    /// Map a negative wire `code` to a variant. Non-negative codes are
    /// not errors; callers must check before converting.
    pub fn from_wire(code: i32) -> Self {
        Self::from_errno(-code)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "no such device"),
            Self::NoEntry => write!(f, "no such attribute"),
            Self::Busy => write!(f, "resource busy"),
            Self::BadFd => write!(f, "bad handle state"),
            Self::BrokenPipe => write!(f, "connection closed by peer"),
            Self::TimedOut => write!(f, "operation timed out"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Protocol => write!(f, "protocol error"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::NoMem => write!(f, "out of memory"),
            Self::Io => write!(f, "I/O error"),
            Self::Os(n) => write!(f, "errno {n}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NoEntry,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Self::BrokenPipe,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            io::ErrorKind::Interrupted => Self::Cancelled,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::InvalidArg,
            io::ErrorKind::Unsupported => Self::NotSupported,
            io::ErrorKind::OutOfMemory => Self::NoMem,
            _ => match e.raw_os_error() {
                Some(n) => Self::from_errno(n),
                None => Self::Io,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        let all = [
            Error::InvalidArg,
            Error::NotFound,
            Error::NoEntry,
            Error::Busy,
            Error::BadFd,
            Error::BrokenPipe,
            Error::TimedOut,
            Error::Cancelled,
            Error::Protocol,
            Error::NotSupported,
            Error::NoMem,
            Error::Io,
        ];
        for e in all {
            assert_eq!(Error::from_errno(e.errno()), e);
            assert_eq!(Error::from_wire(e.wire_code()), e);
        }
    }

    #[test]
    fn unknown_errno_preserved() {
        let e = Error::from_wire(-123);
        assert_eq!(e, Error::Os(123));
        assert_eq!(e.wire_code(), -123);
    }

    #[test]
    fn io_error_mapping() {
        let e: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(e, Error::BrokenPipe);
        let e: Error = io::Error::from_raw_os_error(110).into();
        assert_eq!(e, Error::TimedOut);
    }
}
