//! Mock transport for integration tests.
//!
//! Feeds scripted bytes to the code under test and records every byte
//! it writes, with the same timeout/cancellation semantics as the real
//! transports. No sockets, no timers beyond the condvar waits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use iiod_client::transport::{Deadline, NO_TIMEOUT, Transport};
use iiod_client::{Error, Result};

pub struct MockTransport {
    /// Bytes the client will read, in order.
    rx: Mutex<VecDeque<u8>>,
    rx_cond: Condvar,
    /// Bytes the client wrote.
    tx: Mutex<Vec<u8>>,
    tx_cond: Condvar,
    cancelled: AtomicBool,
    /// Simulated peer hangup: reads fail with BrokenPipe once the
    /// queue is drained.
    closed: AtomicBool,
    default_timeout_ms: u32,
}

#[allow(dead_code)] // not every suite drives every helper
impl MockTransport {
    pub fn new(default_timeout_ms: u32) -> Arc<Self> {
        Arc::new(Self {
            rx: Mutex::new(VecDeque::new()),
            rx_cond: Condvar::new(),
            tx: Mutex::new(Vec::new()),
            tx_cond: Condvar::new(),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            default_timeout_ms,
        })
    }

    /// Queue bytes for the client to read.
    pub fn push(&self, bytes: &[u8]) {
        self.rx.lock().unwrap().extend(bytes);
        self.rx_cond.notify_all();
    }

    /// Simulate the peer closing the connection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rx_cond.notify_all();
    }

    /// Everything the client wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.tx.lock().unwrap().clone()
    }

    /// Block until the client has written at least `count` bytes.
    pub fn wait_written(&self, count: usize) -> Vec<u8> {
        let mut tx = self.tx.lock().unwrap();
        while tx.len() < count {
            let (guard, timed_out) = self
                .tx_cond
                .wait_timeout(tx, Duration::from_secs(5))
                .unwrap();
            tx = guard;
            assert!(!timed_out.timed_out(), "client never wrote {count} bytes");
        }
        tx.clone()
    }

    /// Drop everything recorded so far.
    pub fn clear_written(&self) {
        self.tx.lock().unwrap().clear();
    }

    fn deadline(&self, timeout_ms: u32) -> Deadline {
        let ms = match timeout_ms {
            0 => self.default_timeout_ms,
            NO_TIMEOUT => 0,
            ms => ms,
        };
        Deadline::from_ms(ms)
    }
}

impl Transport for MockTransport {
    fn read(&self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let deadline = self.deadline(timeout_ms);
        let mut rx = self.rx.lock().unwrap();
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if !rx.is_empty() {
                let n = buf.len().min(rx.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = rx.pop_front().unwrap();
                }
                return Ok(n);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::BrokenPipe);
            }

            let wait_ms = match deadline.poll_arg() {
                -1 => 50,
                0 => return Err(Error::TimedOut),
                ms => ms.min(50),
            };
            let (guard, _) = self
                .rx_cond
                .wait_timeout(rx, Duration::from_millis(wait_ms as u64))
                .unwrap();
            rx = guard;
        }
    }

    fn write(&self, data: &[u8], _timeout_ms: u32) -> Result<usize> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        self.tx.lock().unwrap().extend_from_slice(data);
        self.tx_cond.notify_all();
        Ok(data.len())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.rx_cond.notify_all();
    }

    fn default_timeout_ms(&self) -> u32 {
        self.default_timeout_ms
    }
}
