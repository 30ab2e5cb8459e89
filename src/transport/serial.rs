//! Serial transport.
//!
//! RS-232-style links via termios, raw mode, with the same poll-based
//! cancellation as the TCP transport. Line parameters come from the URI
//! (`serial:path,baud,bitsPSF`); the defaults are `115200,8n1n`.

use std::ffi::CString;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::transport::{Deadline, Interest, Transport, WakePipe, wait_ready};
use crate::uri::{FlowControl, Parity, SerialParams};

pub struct SerialTransport {
    fd: RawFd,
    wake: WakePipe,
    default_timeout_ms: u32,
}

impl SerialTransport {
    pub fn open(path: &str, params: SerialParams, timeout_ms: u32) -> Result<Self> {
        let cpath = CString::new(path).map_err(|_| Error::InvalidArg)?;

        // SAFETY: cpath is a valid NUL-terminated string.
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => Error::NotFound,
                _ => err.into(),
            });
        }

        let this = Self {
            fd,
            wake: WakePipe::new()?,
            default_timeout_ms: timeout_ms,
        };
        this.configure(params)?;
        Ok(this)
    }

    fn configure(&self, params: SerialParams) -> Result<()> {
        let speed = speed_constant(params.baud).ok_or(Error::InvalidArg)?;

        // SAFETY: zeroed termios is a valid out-param for tcgetattr.
        let mut tio: libc::termios = unsafe { core::mem::zeroed() };
        // SAFETY: self.fd is open, tio is writable.
        if unsafe { libc::tcgetattr(self.fd, &mut tio) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        // SAFETY: tio was initialised by tcgetattr.
        unsafe {
            libc::cfmakeraw(&mut tio);
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);
        }

        tio.c_cflag |= libc::CLOCAL | libc::CREAD;

        tio.c_cflag &= !libc::CSIZE;
        tio.c_cflag |= match params.bits {
            5 => libc::CS5,
            6 => libc::CS6,
            7 => libc::CS7,
            8 => libc::CS8,
            _ => return Err(Error::InvalidArg),
        };

        tio.c_cflag &= !(libc::PARENB | libc::PARODD | libc::CMSPAR);
        match params.parity {
            Parity::None => {}
            Parity::Odd => tio.c_cflag |= libc::PARENB | libc::PARODD,
            Parity::Even => tio.c_cflag |= libc::PARENB,
            Parity::Mark => tio.c_cflag |= libc::PARENB | libc::CMSPAR | libc::PARODD,
            Parity::Space => tio.c_cflag |= libc::PARENB | libc::CMSPAR,
        }

        match params.stop_bits {
            1 => tio.c_cflag &= !libc::CSTOPB,
            2 => tio.c_cflag |= libc::CSTOPB,
            _ => return Err(Error::InvalidArg),
        }

        tio.c_iflag &= !(libc::IXON | libc::IXOFF);
        tio.c_cflag &= !libc::CRTSCTS;
        match params.flow {
            FlowControl::None => {}
            FlowControl::XonXoff => tio.c_iflag |= libc::IXON | libc::IXOFF,
            FlowControl::RtsCts => tio.c_cflag |= libc::CRTSCTS,
            // termios has no DTR/DSR handshake.
            FlowControl::DtrDsr => return Err(Error::NotSupported),
        }

        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 0;

        // SAFETY: self.fd is open, tio is fully initialised.
        unsafe {
            if libc::tcsetattr(self.fd, libc::TCSANOW, &tio) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            libc::tcflush(self.fd, libc::TCIOFLUSH);
        }
        Ok(())
    }

    fn effective(&self, timeout_ms: u32) -> Deadline {
        let ms = match timeout_ms {
            0 => self.default_timeout_ms,
            crate::transport::NO_TIMEOUT => 0,
            ms => ms,
        };
        Deadline::from_ms(ms)
    }
}

impl Transport for SerialTransport {
    fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let deadline = self.effective(timeout_ms);
        loop {
            wait_ready(self.fd, &self.wake, Interest::Read, deadline)?;

            // SAFETY: buf is a valid writable slice for its full length.
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
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

    fn write(&self, data: &[u8], timeout_ms: u32) -> Result<usize> {
        let deadline = self.effective(timeout_ms);
        loop {
            wait_ready(self.fd, &self.wake, Interest::Write, deadline)?;

            // SAFETY: data is a valid readable slice for its full length.
            let n = unsafe { libc::write(self.fd, data.as_ptr().cast(), data.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR | libc::EAGAIN) => continue,
                _ => return Err(err.into()),
            }
        }
    }

    fn cancel(&self) {
        self.wake.signal();
    }

    fn default_timeout_ms(&self) -> u32 {
        self.default_timeout_ms
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        // SAFETY: fd is owned by self and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn speed_constant(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        921_600 => libc::B921600,
        1_000_000 => libc::B1000000,
        _ => return None,
    })
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_baud_rates_map() {
        for baud in [9600u32, 115_200, 921_600] {
            assert!(speed_constant(baud).is_some());
        }
        assert!(speed_constant(12345).is_none());
    }

    #[test]
    fn missing_device_is_not_found() {
        let params = SerialParams::default();
        let err = SerialTransport::open("/dev/does-not-exist-9999", params, 100);
        assert!(matches!(err, Err(Error::NotFound)));
    }
}
