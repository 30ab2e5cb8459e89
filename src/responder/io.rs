//! I/O correlation handle.
//!
//! An `IiodIo` pairs one in-flight request with the response the reader
//! thread will deliver for its `client_id`. At any moment a handle is
//! idle, awaiting-send-completion (a write token is queued), linked in
//! the responder's reader list awaiting a response, or cancelled.
//!
//! Handles are refcounted (`Arc`); the responder's reader list holds a
//! reference while the handle is linked, so cancellation never races
//! deletion.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::proto::Command;
use crate::responder::Shared;
use crate::responder::writer::{WriteJob, WriterTask};
use crate::transport::Deadline;

pub(crate) struct IoInner {
    pub r_done: bool,
    pub resp_code: i32,
    /// Buffers registered for the next response, filled by the reader.
    pub resp_bufs: Vec<Vec<u8>>,
    /// Start of the current request, for timeout accounting.
    pub start: Instant,
    /// Outstanding write token, if a send is queued or running.
    pub job: Option<Arc<WriteJob>>,
}

/// Correlation handle for one client id.
pub struct IiodIo {
    client_id: u16,
    shared: Arc<Shared>,
    writer: Arc<WriterTask>,
    timeout_ms: AtomicU32,
    pub(crate) inner: Mutex<IoInner>,
    pub(crate) cond: Condvar,
}

impl IiodIo {
    pub(crate) fn new(
        client_id: u16,
        shared: Arc<Shared>,
        writer: Arc<WriterTask>,
        timeout_ms: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            shared,
            writer,
            timeout_ms: AtomicU32::new(timeout_ms),
            inner: Mutex::new(IoInner {
                r_done: false,
                resp_code: 0,
                resp_bufs: Vec::new(),
                start: Instant::now(),
                job: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// Per-handle timeout; inherited from the responder at creation,
    /// overridable before use. Zero never times out.
    pub fn set_timeout(&self, timeout_ms: u32) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    fn deadline(&self) -> Deadline {
        Deadline::from_ms(self.timeout_ms())
    }

    /// Register response buffers and link into the reader list.
    ///
    /// Must precede any send whose response is expected, otherwise the
    /// response can arrive before the handle is linked and be dropped
    /// as an orphan.
    pub fn get_response_async(self: &Arc<Self>, bufs: Vec<Vec<u8>>) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(err) = state.err {
            return Err(err);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.r_done = false;
            inner.resp_code = 0;
            inner.resp_bufs = bufs;
            inner.start = Instant::now();
        }
        // Tail of the list: responses are matched first-come.
        state.readers.push(Arc::clone(self));
        Ok(())
    }

    /// Serialise `cmd` (+ payload buffers, in order) through the writer
    /// task. Returns once enqueued; completion is observed via
    /// [`wait_for_command_done`].
    ///
    /// [`wait_for_command_done`]: Self::wait_for_command_done
    pub fn send_command_async(&self, cmd: Command, payload: Vec<Vec<u8>>) -> Result<()> {
        if let Some(err) = self.shared.state.lock().unwrap().err {
            return Err(err);
        }

        let job = WriteJob::new(cmd.to_bytes(), payload);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.start = Instant::now();
            inner.job = Some(Arc::clone(&job));
        }
        self.writer.enqueue(&job)
    }

    /// Join the outstanding write token. An already-expired deadline
    /// cancels the token instead of waiting for it.
    pub fn wait_for_command_done(&self) -> Result<()> {
        let job = self.inner.lock().unwrap().job.clone();
        match job {
            Some(job) => job.wait_done(self.deadline()),
            None => Ok(()),
        }
    }

    /// Reclaim the payload buffers of the last completed send.
    pub(crate) fn take_request_payload(&self) -> Vec<Vec<u8>> {
        let job = self.inner.lock().unwrap().job.clone();
        job.map(|j| j.take_payload()).unwrap_or_default()
    }

    /// Block until the reader delivers this handle's response or the
    /// timeout elapses. A negative response code maps to `Err`; on
    /// timeout the handle is unlinked and fails with `TimedOut`.
    pub fn wait_for_response(self: &Arc<Self>) -> Result<i32> {
        let deadline = Deadline::from_ms_at(self.timeout_ms(), self.inner.lock().unwrap().start);

        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                loop {
                    if inner.r_done {
                        let code = inner.resp_code;
                        return if code < 0 {
                            Err(Error::from_wire(code))
                        } else {
                            Ok(code)
                        };
                    }
                    let ms = deadline.poll_arg();
                    if ms < 0 {
                        inner = self.cond.wait(inner).unwrap();
                    } else if ms == 0 {
                        break; // expired; unlink outside the handle lock
                    } else {
                        let (guard, _) = self
                            .cond
                            .wait_timeout(inner, std::time::Duration::from_millis(ms as u64))
                            .unwrap();
                        inner = guard;
                    }
                }
            }

            // Deadline hit: unlink, then re-check for a response that
            // raced in while the handle lock was released.
            self.unlink();
            let mut inner = self.inner.lock().unwrap();
            if inner.r_done {
                continue;
            }
            inner.r_done = true;
            inner.resp_code = Error::TimedOut.wire_code();
            return Err(Error::TimedOut);
        }
    }

    /// Take back the buffers registered with [`get_response_async`].
    ///
    /// [`get_response_async`]: Self::get_response_async
    pub fn take_response_buffers(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.inner.lock().unwrap().resp_bufs)
    }

    /// Poll without blocking: `Ok(Some(code))` once the response is in,
    /// `Ok(None)` while still pending.
    pub fn try_response(&self) -> Result<Option<i32>> {
        let inner = self.inner.lock().unwrap();
        if !inner.r_done {
            return Ok(None);
        }
        if inner.resp_code < 0 {
            return Err(Error::from_wire(inner.resp_code));
        }
        Ok(Some(inner.resp_code))
    }

    /// True once the outstanding write token has left the queue.
    pub fn command_done(&self) -> bool {
        let job = self.inner.lock().unwrap().job.clone();
        job.is_none_or(|j| j.is_settled())
    }

    /// Cancel the handle: unlink from the reader list, cancel the write
    /// token synchronously, and wake any waiter with `Cancelled`.
    /// Idempotent.
    pub fn cancel(self: &Arc<Self>) {
        self.unlink();

        let job = self.inner.lock().unwrap().job.take();
        if let Some(job) = job {
            job.cancel();
        }

        let mut inner = self.inner.lock().unwrap();
        if !inner.r_done {
            inner.r_done = true;
            inner.resp_code = Error::Cancelled.wire_code();
            self.cond.notify_all();
        }
    }

    /// Remove this handle from the responder's reader list, if linked.
    fn unlink(self: &Arc<Self>) {
        let mut state = self.shared.state.lock().unwrap();
        state
            .readers
            .retain(|io| !Arc::ptr_eq(io, self));
    }

    // ── Composite exchanges ──────────────────────────────────

    /// Full round trip: link for the response, send, wait.
    pub fn exec(
        self: &Arc<Self>,
        cmd: Command,
        payload: Vec<Vec<u8>>,
        resp_bufs: Vec<Vec<u8>>,
    ) -> Result<(i32, Vec<Vec<u8>>)> {
        self.get_response_async(resp_bufs)?;
        if let Err(err) = self.send_command_async(cmd, payload) {
            self.cancel();
            return Err(err);
        }
        let code = self.wait_for_response();
        let bufs = self.take_response_buffers();
        Ok((code?, bufs))
    }

    /// Round trip with no payload in either direction.
    pub fn exec_simple(self: &Arc<Self>, cmd: Command) -> Result<i32> {
        self.exec(cmd, Vec::new(), Vec::new()).map(|(code, _)| code)
    }
}
