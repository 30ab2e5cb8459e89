//! Responder — pairs outgoing commands with incoming responses.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Responder                             │
//! │                                                              │
//! │  caller ──▶ IiodIo ──▶ WriterTask ──▶ ┌───────────┐          │
//! │     ▲       (token)    (FIFO, one     │ Transport │          │
//! │     │                   runner)       └─────┬─────┘          │
//! │     │                                       │                │
//! │     └── cond-var ◀── reader thread ◀────────┘                │
//! │         signal        (correlates by client_id,              │
//! │                        drains orphans)                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! One reader thread is the sole consumer of the wire; one writer task
//! is the sole producer. Responses are matched to waiting handles by
//! `client_id` only, so responses may interleave freely across
//! handles. A fatal transport error is sticky: every current waiter is
//! woken with it and every later operation fails fast.

pub mod io;
pub(crate) mod writer;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, warn};

use crate::error::Error;
use crate::proto::{Command, HDR_LEN, Opcode};
use crate::transport::{NO_TIMEOUT, Transport, read_exact};
use io::IiodIo;
use writer::{WriteJob, WriterTask};

/// Client id of the default handle used for device-scoped operations.
pub const DEFAULT_CLIENT_ID: u16 = 0;

pub(crate) struct State {
    /// Handles awaiting a response, linked in registration order.
    pub readers: Vec<Arc<IiodIo>>,
    pub next_client_id: u16,
    pub stopped: bool,
    /// Sticky session error; set once, surfaced to everything after.
    pub err: Option<Error>,
}

pub(crate) struct Shared {
    pub state: Mutex<State>,
    pub xport: Arc<dyn Transport>,
}

/// The correlation engine for one connection.
pub struct Responder {
    shared: Arc<Shared>,
    writer: Arc<WriterTask>,
    timeout_ms: AtomicU32,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
    default_io: Mutex<Option<Arc<IiodIo>>>,
}

impl Responder {
    /// Take ownership of `xport` and start the reader thread and the
    /// writer task. `timeout_ms` is the default inherited by each
    /// fresh I/O handle.
    pub fn new(xport: Arc<dyn Transport>, timeout_ms: u32) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                readers: Vec::new(),
                next_client_id: 1,
                stopped: false,
                err: None,
            }),
            xport: Arc::clone(&xport),
        });
        let writer = Arc::new(WriterTask::spawn(Arc::clone(&xport)));

        let responder = Arc::new(Self {
            shared: Arc::clone(&shared),
            writer: Arc::clone(&writer),
            timeout_ms: AtomicU32::new(timeout_ms),
            reader: Mutex::new(None),
            default_io: Mutex::new(None),
        });

        let reader_shared = Arc::clone(&shared);
        let reader_writer = Arc::clone(&writer);
        let handle = thread::Builder::new()
            .name("iiod-reader".to_owned())
            .spawn(move || reader_loop(&reader_shared, &reader_writer))
            .expect("spawning the reader thread");
        *responder.reader.lock().unwrap() = Some(handle);

        debug!("responder started (default timeout {timeout_ms} ms)");
        responder
    }

    /// Default timeout inherited by fresh handles.
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, timeout_ms: u32) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
        // The default handle inherited the old value at creation.
        if let Some(io) = self.default_io.lock().unwrap().as_ref() {
            io.set_timeout(timeout_ms);
        }
    }

    /// The handle with `client_id == 0`, shared by device-scoped
    /// operations on this connection.
    pub fn default_io(self: &Arc<Self>) -> Arc<IiodIo> {
        let mut slot = self.default_io.lock().unwrap();
        if let Some(io) = slot.as_ref() {
            return Arc::clone(io);
        }
        let io = IiodIo::new(
            DEFAULT_CLIENT_ID,
            Arc::clone(&self.shared),
            Arc::clone(&self.writer),
            self.timeout_ms(),
        );
        *slot = Some(Arc::clone(&io));
        io
    }

    /// Fresh handle with an allocated client id.
    pub fn create_io(self: &Arc<Self>) -> Arc<IiodIo> {
        let id = self.alloc_client_id();
        self.create_io_with_id(id)
    }

    /// Fresh handle with a caller-chosen client id (blocks correlate
    /// by `block_idx + 1`).
    pub fn create_io_with_id(self: &Arc<Self>, client_id: u16) -> Arc<IiodIo> {
        IiodIo::new(
            client_id,
            Arc::clone(&self.shared),
            Arc::clone(&self.writer),
            self.timeout_ms(),
        )
    }

    /// Monotonic allocation, skipping 0 and any id still linked in the
    /// reader list.
    fn alloc_client_id(&self) -> u16 {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            let id = state.next_client_id;
            state.next_client_id = state.next_client_id.wrapping_add(1).max(1);
            if !state.readers.iter().any(|io| io.client_id() == id) {
                return id;
            }
        }
    }

    /// Sticky session error, if the session has failed.
    pub fn session_error(&self) -> Option<Error> {
        self.shared.state.lock().unwrap().err
    }

    /// Stop both threads and fail all waiters with `Cancelled`.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.shared.xport.cancel();
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Reader thread ────────────────────────────────────────────

fn reader_loop(shared: &Arc<Shared>, writer: &Arc<WriterTask>) {
    let err = loop {
        let mut hdr = [0u8; HDR_LEN];
        if let Err(err) = read_exact(shared.xport.as_ref(), &mut hdr, NO_TIMEOUT) {
            break err;
        }
        let cmd = Command::from_bytes(&hdr);

        if cmd.opcode() != Some(Opcode::Response) {
            // This runtime is a pure client; it never accepts commands.
            warn!(
                "reader: unexpected command opcode {:#04x}, rejecting",
                cmd.op
            );
            let reject = Command::new(
                Opcode::Response,
                cmd.dev,
                cmd.client_id,
                Error::InvalidArg.wire_code(),
            );
            let _ = writer.enqueue(&WriteJob::new(reject.to_bytes(), Vec::new()));
            continue;
        }

        // Find and unlink the waiting handle.
        let io = {
            let mut state = shared.state.lock().unwrap();
            let pos = state
                .readers
                .iter()
                .position(|io| io.client_id() == cmd.client_id);
            pos.map(|idx| state.readers.remove(idx))
        };

        let Some(io) = io else {
            // Orphan: drain its payload and keep the session healthy.
            if cmd.code > 0 {
                debug!(
                    "reader: orphan response for client {} ({} bytes), draining",
                    cmd.client_id, cmd.code
                );
                if let Err(err) =
                    shared
                        .xport
                        .discard(cmd.code as usize, NO_TIMEOUT)
                {
                    break err;
                }
            }
            continue;
        };

        let mut inner = io.inner.lock().unwrap();
        let mut code = cmd.code;

        if code > 0 {
            let capacity: usize = inner.resp_bufs.iter().map(Vec::len).sum();
            let mut remaining = code as usize;

            'fill: for buf in &mut inner.resp_bufs {
                let want = buf.len().min(remaining);
                if want == 0 {
                    continue;
                }
                if let Err(err) = read_exact(shared.xport.as_ref(), &mut buf[..want], NO_TIMEOUT) {
                    // Partial read propagates as a negative code; a
                    // fatal wire error also ends the session.
                    code = err.wire_code();
                    inner.r_done = true;
                    inner.resp_code = code;
                    io.cond.notify_all();
                    drop(inner);
                    shutdown_with(shared, writer, err);
                    return;
                }
                remaining -= want;
                if remaining == 0 {
                    break 'fill;
                }
            }

            // Excess past the registered capacity is discarded.
            if remaining > 0 {
                debug!(
                    "reader: response for client {} exceeds capacity ({} > {}), discarding excess",
                    cmd.client_id, cmd.code, capacity
                );
                if let Err(err) = shared.xport.discard(remaining, NO_TIMEOUT) {
                    code = err.wire_code();
                    inner.r_done = true;
                    inner.resp_code = code;
                    io.cond.notify_all();
                    drop(inner);
                    shutdown_with(shared, writer, err);
                    return;
                }
            }
        }

        inner.r_done = true;
        inner.resp_code = code;
        io.cond.notify_all();
    };

    shutdown_with(shared, writer, err);
}

/// Record the sticky error, fail every waiter with it, and stop the
/// writer task.
fn shutdown_with(shared: &Arc<Shared>, writer: &Arc<WriterTask>, err: Error) {
    // A requested stop surfaces as Cancelled from the transport.
    let waiters = {
        let mut state = shared.state.lock().unwrap();
        if state.err.is_none() {
            state.err = Some(err);
        }
        std::mem::take(&mut state.readers)
    };

    if err != Error::Cancelled {
        warn!("reader: session failed: {err}");
    } else {
        debug!("reader: stopping");
    }

    for io in waiters {
        let mut inner = io.inner.lock().unwrap();
        if !inner.r_done {
            inner.r_done = true;
            inner.resp_code = err.wire_code();
            io.cond.notify_all();
        }
    }

    writer.stop_and_flush(err);
}
