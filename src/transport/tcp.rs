//! TCP transport.
//!
//! IPv4 and IPv6, `TCP_NODELAY` set at connect. The socket runs in
//! non-blocking mode; every wait goes through `poll(2)` on the socket
//! plus the wake pipe, so [`cancel`] interrupts reads and writes from
//! any thread. Line reads use `MSG_PEEK` to avoid byte-at-a-time
//! syscalls.
//!
//! [`cancel`]: crate::transport::Transport::cancel

use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{Deadline, Interest, Transport, WakePipe, wait_ready};

pub struct TcpTransport {
    stream: TcpStream,
    wake: WakePipe,
    default_timeout_ms: u32,
}

impl TcpTransport {
    /// Connect to `host:port`, trying each resolved address in turn.
    pub fn connect(host: &str, port: u16, timeout_ms: u32) -> Result<Self> {
        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::NotFound)?
            .collect();

        let mut last_err = Error::NotFound;
        for addr in addrs {
            let attempt = if timeout_ms == 0 {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, Duration::from_millis(timeout_ms.into()))
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(Error::from)?;
                    stream.set_nonblocking(true).map_err(Error::from)?;
                    return Ok(Self {
                        stream,
                        wake: WakePipe::new()?,
                        default_timeout_ms: timeout_ms,
                    });
                }
                Err(e) => last_err = e.into(),
            }
        }
        Err(last_err)
    }

    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn effective(&self, timeout_ms: u32) -> Deadline {
        let ms = match timeout_ms {
            0 => self.default_timeout_ms,
            crate::transport::NO_TIMEOUT => 0,
            ms => ms,
        };
        Deadline::from_ms(ms)
    }

    /// One non-blocking `recv`; `peek` leaves the bytes queued.
    fn recv(&self, buf: &mut [u8], peek: bool, deadline: Deadline) -> Result<usize> {
        loop {
            wait_ready(self.fd(), &self.wake, Interest::Read, deadline)?;

            let flags = if peek { libc::MSG_PEEK } else { 0 };
            // SAFETY: buf is a valid writable slice for its full length.
            let n = unsafe {
                libc::recv(self.fd(), buf.as_mut_ptr().cast(), buf.len(), flags)
            };
            match n {
                0 => return Err(Error::BrokenPipe),
                n if n > 0 => return Ok(n as usize),
                _ => {
                    let err = std::io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EINTR | libc::EAGAIN) => continue,
                        _ => return Err(err.into()),
                    }
                }
            }
        }
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.recv(buf, false, self.effective(timeout_ms))
    }

    fn write(&self, data: &[u8], timeout_ms: u32) -> Result<usize> {
        let deadline = self.effective(timeout_ms);
        loop {
            wait_ready(self.fd(), &self.wake, Interest::Write, deadline)?;

            // SAFETY: data is a valid readable slice for its full length.
            let n = unsafe {
                libc::send(
                    self.fd(),
                    data.as_ptr().cast(),
                    data.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR | libc::EAGAIN) => continue,
                Some(libc::EPIPE) => return Err(Error::BrokenPipe),
                _ => return Err(err.into()),
            }
        }
    }

    /// Peek-then-truncate line read: scan queued bytes without
    /// consuming, then consume exactly through the `\n`.
    fn read_line(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let deadline = self.effective(timeout_ms);
        let mut window = vec![0u8; buf.len() + 1];

        loop {
            let peeked = self.recv(&mut window, true, deadline)?;
            if let Some(nl) = window[..peeked].iter().position(|&b| b == b'\n') {
                if nl > buf.len() {
                    return Err(Error::InvalidArg);
                }
                // Consume the line and its terminator.
                let mut scratch = vec![0u8; nl + 1];
                let mut got = 0usize;
                while got < scratch.len() {
                    got += self.recv(&mut scratch[got..], false, deadline)?;
                }
                buf[..nl].copy_from_slice(&scratch[..nl]);
                return Ok(nl);
            }
            if peeked >= window.len() {
                return Err(Error::InvalidArg);
            }
            // No terminator queued yet; poll for more.
        }
    }

    fn cancel(&self) {
        self.wake.signal();
    }

    fn default_timeout_ms(&self) -> u32 {
        self.default_timeout_ms
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::write_all;
    use std::io::Write;
    use std::net::TcpListener;

    fn pair() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpTransport::connect("127.0.0.1", port, 1000).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn read_returns_available_bytes() {
        let (client, mut server) = pair();
        server.write_all(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf, 1000).unwrap();
        assert!(n >= 1 && n <= 5);
        assert_eq!(&buf[..n], &b"hello"[..n]);
    }

    #[test]
    fn read_times_out() {
        let (client, _server) = pair();
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf, 50), Err(Error::TimedOut));
    }

    #[test]
    fn read_reports_eof_as_broken_pipe() {
        let (client, server) = pair();
        drop(server);
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf, 1000), Err(Error::BrokenPipe));
    }

    #[test]
    fn cancel_unblocks_reader() {
        let (client, _server) = pair();
        let client = std::sync::Arc::new(client);
        let reader = client.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf, 0)
        });
        std::thread::sleep(Duration::from_millis(50));
        client.cancel();
        assert_eq!(handle.join().unwrap(), Err(Error::Cancelled));
    }

    #[test]
    fn line_read_consumes_terminator_only() {
        let (client, mut server) = pair();
        server.write_all(b"42\nrest").unwrap();

        let mut line = [0u8; 32];
        let n = client.read_line(&mut line, 1000).unwrap();
        assert_eq!(&line[..n], b"42");

        let mut rest = [0u8; 4];
        let n = client.read(&mut rest, 1000).unwrap();
        assert_eq!(&rest[..n], &b"rest"[..n]);
    }

    #[test]
    fn discard_drops_exact_count() {
        let (client, mut server) = pair();
        server.write_all(b"0123456789").unwrap();

        assert_eq!(client.discard(4, 1000).unwrap(), 4);
        let mut rest = [0u8; 8];
        let n = client.read(&mut rest, 1000).unwrap();
        assert_eq!(&rest[..n], &b"456789"[..n]);
    }

    #[test]
    fn write_all_round_trip() {
        let (client, mut server) = pair();
        write_all(&client, b"ping", 1000).unwrap();
        let mut buf = [0u8; 4];
        std::io::Read::read_exact(&mut server, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
