//! Transport abstraction — any byte-oriented duplex channel.
//!
//! Concrete implementations:
//! - TCP socket (IPv4/IPv6, `TCP_NODELAY`)
//! - RS-232-style serial link (termios)
//!
//! The protocol engine is generic over `Transport`, so adding a new
//! transport requires zero changes to the protocol logic. Every
//! transport supports *cooperative cancellation*: `cancel()` may be
//! called from any thread and unblocks in-flight reads and writes with
//! [`Error::Cancelled`]. The mechanism is a self-pipe polled alongside
//! the data fd; blocking waits always go through `poll(2)` on both.

pub mod serial;
pub mod tcp;

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::uri::Uri;

/// Explicit "block forever" timeout, bypassing the transport default.
/// The responder's reader waits indefinitely between responses.
pub const NO_TIMEOUT: u32 = u32::MAX;

/// Byte-oriented transport channel.
///
/// `timeout_ms == 0` on any call means "use the transport's configured
/// default"; a zero default or [`NO_TIMEOUT`] means "block forever".
/// Cancellation always beats timeout.
pub trait Transport: Send + Sync {
    /// Read between 1 and `buf.len()` bytes into `buf`.
    fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize>;

    /// Write between 1 and `data.len()` bytes from `data`.
    fn write(&self, data: &[u8], timeout_ms: u32) -> Result<usize>;

    /// Read and drop `count` bytes.
    fn discard(&self, count: usize, timeout_ms: u32) -> Result<usize> {
        let mut scratch = [0u8; 256];
        let mut dropped = 0usize;
        while dropped < count {
            let want = (count - dropped).min(scratch.len());
            dropped += self.read(&mut scratch[..want], timeout_ms)?;
        }
        Ok(dropped)
    }

    /// Read one `\n`-terminated line into `buf`, consuming the
    /// terminator but not storing it. Returns the line length.
    ///
    /// The default reads byte-at-a-time; transports with a peek
    /// primitive override this.
    fn read_line(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let mut pos = 0usize;
        loop {
            let mut byte = [0u8; 1];
            self.read(&mut byte, timeout_ms)?;
            if byte[0] == b'\n' {
                return Ok(pos);
            }
            if pos >= buf.len() {
                return Err(Error::InvalidArg);
            }
            buf[pos] = byte[0];
            pos += 1;
        }
    }

    /// Unblock any in-flight read/write with [`Error::Cancelled`].
    /// Idempotent; safe from any thread.
    fn cancel(&self);

    /// Default timeout applied when a call passes 0.
    fn default_timeout_ms(&self) -> u32;
}

/// Write all of `data`, looping over short writes.
pub fn write_all(t: &dyn Transport, mut data: &[u8], timeout_ms: u32) -> Result<()> {
    while !data.is_empty() {
        let n = t.write(data, timeout_ms)?;
        data = &data[n..];
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes, looping over short reads.
pub fn read_exact(t: &dyn Transport, buf: &mut [u8], timeout_ms: u32) -> Result<()> {
    let mut pos = 0usize;
    while pos < buf.len() {
        pos += t.read(&mut buf[pos..], timeout_ms)?;
    }
    Ok(())
}

// ── Deadlines ────────────────────────────────────────────────

/// Absolute deadline derived from a millisecond timeout.
/// Zero means "no deadline".
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    pub fn from_ms(timeout_ms: u32) -> Self {
        Self::from_ms_at(timeout_ms, Instant::now())
    }

    /// Deadline anchored at an earlier start point.
    pub fn from_ms_at(timeout_ms: u32, start: Instant) -> Self {
        Self {
            end: (timeout_ms != 0).then(|| start + Duration::from_millis(timeout_ms.into())),
        }
    }

    /// Remaining milliseconds as `poll(2)` expects: -1 for "forever",
    /// 0 when already expired.
    pub fn poll_arg(&self) -> i32 {
        match self.end {
            None => -1,
            Some(end) => {
                let left = end.saturating_duration_since(Instant::now()).as_millis();
                i32::try_from(left).unwrap_or(i32::MAX)
            }
        }
    }

    pub fn expired(&self) -> bool {
        self.end.is_some_and(|end| Instant::now() >= end)
    }
}

// ── Cancellation machinery ───────────────────────────────────

/// Self-pipe used to interrupt `poll(2)` waits.
#[derive(Debug)]
pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
    cancelled: AtomicBool,
}

impl WakePipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds points at two writable ints.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        for fd in fds {
            // SAFETY: fd was just returned by pipe().
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
            cancelled: AtomicBool::new(false),
        })
    }

    /// Edge-trigger the wake fd and latch the cancelled flag.
    pub fn signal(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            let byte = [0u8; 1];
            // SAFETY: write_fd is owned by self; short/failed writes are
            // fine, the latched flag is authoritative.
            unsafe {
                let _ = libc::write(self.write_fd, byte.as_ptr().cast(), 1);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        // SAFETY: both fds are owned by self and closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Which direction a transport wait is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Wait until `fd` is ready for `interest`, the wake pipe fires, or the
/// deadline expires. EINTR retries against the absolute deadline.
pub(crate) fn wait_ready(fd: RawFd, wake: &WakePipe, interest: Interest, deadline: Deadline) -> Result<()> {
    loop {
        if wake.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let events = match interest {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
        };
        let mut fds = [
            libc::pollfd { fd, events, revents: 0 },
            libc::pollfd {
                fd: wake.read_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: fds is a valid array of two pollfd.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, deadline.poll_arg()) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }

        // Cancellation beats timeout.
        if fds[1].revents != 0 || wake.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if rc == 0 {
            return Err(Error::TimedOut);
        }
        if fds[0].revents & (events | libc::POLLHUP | libc::POLLERR) != 0 {
            return Ok(());
        }
    }
}

// ── Connector ────────────────────────────────────────────────

/// Opens transports for one parsed URI. A context keeps its connector
/// around: every buffer opens an additional independent connection.
#[derive(Debug, Clone)]
pub struct Connector {
    uri: Uri,
    timeout_ms: u32,
}

impl Connector {
    pub fn new(uri: Uri, timeout_ms: u32) -> Self {
        Self { uri, timeout_ms }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Open a fresh connection.
    pub fn connect(&self) -> Result<Box<dyn Transport>> {
        match &self.uri {
            Uri::Ip { host, port } if host.is_empty() => {
                // mDNS discovery of _iio._tcp.local is an external
                // collaborator, not part of this runtime.
                let _ = port;
                Err(Error::NotSupported)
            }
            Uri::Ip { host, port } => Ok(Box::new(tcp::TcpTransport::connect(
                host,
                *port,
                self.timeout_ms,
            )?)),
            Uri::Serial { path, params } => Ok(Box::new(serial::SerialTransport::open(
                path,
                *params,
                self.timeout_ms,
            )?)),
            // The sysfs/DMABUF backend and USB enumeration live behind
            // separate collaborators.
            Uri::Local | Uri::Usb { .. } => Err(Error::NotSupported),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_zero_never_expires() {
        let d = Deadline::from_ms(0);
        assert_eq!(d.poll_arg(), -1);
        assert!(!d.expired());
    }

    #[test]
    fn deadline_counts_down() {
        let d = Deadline::from_ms(10_000);
        let arg = d.poll_arg();
        assert!(arg > 8_000 && arg <= 10_000);
        assert!(!d.expired());
    }

    #[test]
    fn wake_pipe_latches() {
        let wake = WakePipe::new().unwrap();
        assert!(!wake.is_cancelled());
        wake.signal();
        wake.signal(); // idempotent
        assert!(wake.is_cancelled());
    }

    #[test]
    fn wait_ready_observes_cancel() {
        let wake = WakePipe::new().unwrap();
        wake.signal();
        // Poll a valid fd that will never become readable on its own.
        let idle = WakePipe::new().unwrap();
        let err = wait_ready(idle.read_fd, &wake, Interest::Read, Deadline::from_ms(0));
        assert_eq!(err, Err(Error::Cancelled));
    }

    #[test]
    fn wait_ready_times_out() {
        let wake = WakePipe::new().unwrap();
        let idle = WakePipe::new().unwrap();
        let err = wait_ready(idle.read_fd, &wake, Interest::Read, Deadline::from_ms(20));
        assert_eq!(err, Err(Error::TimedOut));
    }
}
