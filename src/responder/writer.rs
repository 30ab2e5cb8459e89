//! Writer task — the single consumer of the outbound wire.
//!
//! All requests funnel through one FIFO drained by one runner thread,
//! so the bytes of one request (header + payload buffers) are never
//! interleaved with another's. Each enqueued request is represented by
//! a [`WriteJob`] token: Queued → Running → Done, or Cancelled while
//! still queued.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

use crate::error::{Error, Result};
use crate::proto::HDR_LEN;
use crate::transport::{Deadline, Transport, write_all};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    /// Finished; `Ok(())` or the write error.
    Done,
    /// Removed from the queue before running; nothing hit the wire.
    Cancelled,
}

struct JobInner {
    phase: Phase,
    result: Result<()>,
    header: [u8; HDR_LEN],
    payload: Vec<Vec<u8>>,
}

/// Write token for one enqueued request.
pub(crate) struct WriteJob {
    inner: Mutex<JobInner>,
    cond: Condvar,
}

impl WriteJob {
    pub fn new(header: [u8; HDR_LEN], payload: Vec<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(JobInner {
                phase: Phase::Queued,
                result: Ok(()),
                header,
                payload,
            }),
            cond: Condvar::new(),
        })
    }

    /// Cancel the token. A queued job is marked cancelled and skipped
    /// by the runner; a running job is waited for, so when this
    /// returns the token no longer touches the wire.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            Phase::Queued => {
                inner.phase = Phase::Cancelled;
                inner.result = Err(Error::Cancelled);
                self.cond.notify_all();
            }
            Phase::Running => {
                while inner.phase == Phase::Running {
                    inner = self.cond.wait(inner).unwrap();
                }
            }
            Phase::Done | Phase::Cancelled => {}
        }
    }

    /// Block until the job left the queue (done or cancelled), bounded
    /// by `deadline`. A deadline that already expired cancels first.
    pub fn wait_done(&self, deadline: Deadline) -> Result<()> {
        if deadline.expired() {
            self.cancel();
        }

        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.phase {
                Phase::Done | Phase::Cancelled => return inner.result,
                _ => {}
            }
            let ms = deadline.poll_arg();
            if ms < 0 {
                inner = self.cond.wait(inner).unwrap();
            } else {
                let (guard, timed_out) = self
                    .cond
                    .wait_timeout(inner, std::time::Duration::from_millis(ms as u64))
                    .unwrap();
                inner = guard;
                if timed_out.timed_out()
                    && !matches!(inner.phase, Phase::Done | Phase::Cancelled)
                {
                    return Err(Error::TimedOut);
                }
            }
        }
    }

    /// Reclaim the payload buffers after the job left the queue.
    pub fn take_payload(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.inner.lock().unwrap().payload)
    }

    /// True once the job is done or cancelled.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().phase,
            Phase::Done | Phase::Cancelled
        )
    }

}

/// FIFO of write jobs with a single runner thread.
pub(crate) struct WriterTask {
    tx: Mutex<Option<mpsc::Sender<Arc<WriteJob>>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    fail: Arc<Mutex<Option<Error>>>,
}

impl WriterTask {
    pub fn spawn(xport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::channel::<Arc<WriteJob>>();
        let fail = Arc::new(Mutex::new(None));
        let runner_fail = Arc::clone(&fail);
        let handle = thread::Builder::new()
            .name("iiod-writer".to_owned())
            .spawn(move || run(&rx, xport.as_ref(), &runner_fail))
            .expect("spawning the writer thread");

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            fail,
        }
    }

    /// Append a job to the FIFO.
    pub fn enqueue(&self, job: &Arc<WriteJob>) -> Result<()> {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx.send(Arc::clone(job)).map_err(|_| Error::BadFd),
            None => Err(Error::BadFd),
        }
    }

    /// Close the queue and join the runner. Jobs still queued drain
    /// without touching the wire; each completes with `err`.
    pub fn stop_and_flush(&self, err: Error) {
        *self.fail.lock().unwrap() = Some(err);
        let tx = self.tx.lock().unwrap().take();
        drop(tx); // runner's recv() now drains and terminates
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run(rx: &mpsc::Receiver<Arc<WriteJob>>, xport: &dyn Transport, fail: &Mutex<Option<Error>>) {
    let mut session_err: Option<Error> = None;

    while let Ok(job) = rx.recv() {
        let mut inner = job.inner.lock().unwrap();
        if inner.phase != Phase::Queued {
            continue;
        }
        if session_err.is_none() {
            session_err = *fail.lock().unwrap();
        }
        if let Some(err) = session_err {
            inner.phase = Phase::Done;
            inner.result = Err(err);
            job.cond.notify_all();
            continue;
        }
        inner.phase = Phase::Running;

        let mut result = write_all(xport, &inner.header, 0);
        if result.is_ok() {
            for buf in &inner.payload {
                result = write_all(xport, buf, 0);
                if result.is_err() {
                    break;
                }
            }
        }

        if let Err(err) = result {
            debug!("writer: wire write failed: {err}");
            session_err = Some(err);
        }
        inner.phase = Phase::Done;
        inner.result = result;
        job.cond.notify_all();
    }
    debug!("writer: queue closed, runner exiting");
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Deadline;
    use std::sync::Mutex as StdMutex;

    /// Transport that records writes; reads always time out.
    struct SinkTransport {
        written: StdMutex<Vec<u8>>,
        fail: bool,
    }

    impl SinkTransport {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                written: StdMutex::new(Vec::new()),
                fail,
            })
        }
    }

    impl Transport for SinkTransport {
        fn read(&self, _buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
            Err(Error::TimedOut)
        }

        fn write(&self, data: &[u8], _timeout_ms: u32) -> Result<usize> {
            if self.fail {
                return Err(Error::BrokenPipe);
            }
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn cancel(&self) {}

        fn default_timeout_ms(&self) -> u32 {
            0
        }
    }

    #[test]
    fn jobs_write_header_then_payload_in_order() {
        let xport = SinkTransport::new(false);
        let writer = WriterTask::spawn(xport.clone());

        let job = WriteJob::new([1; HDR_LEN], vec![vec![2, 2], vec![3]]);
        writer.enqueue(&job).unwrap();
        job.wait_done(Deadline::from_ms(1000)).unwrap();

        assert_eq!(
            *xport.written.lock().unwrap(),
            [1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 3]
        );
        writer.stop_and_flush(Error::BadFd);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let xport = SinkTransport::new(false);
        let writer = WriterTask::spawn(xport.clone());

        let first = WriteJob::new([0xAA; HDR_LEN], vec![]);
        let second = WriteJob::new([0xBB; HDR_LEN], vec![]);
        writer.enqueue(&first).unwrap();
        writer.enqueue(&second).unwrap();
        second.wait_done(Deadline::from_ms(1000)).unwrap();

        let written = xport.written.lock().unwrap();
        assert_eq!(&written[..HDR_LEN], &[0xAA; HDR_LEN]);
        assert_eq!(&written[HDR_LEN..], &[0xBB; HDR_LEN]);
        drop(written);
        writer.stop_and_flush(Error::BadFd);
    }

    #[test]
    fn cancelled_job_never_hits_the_wire() {
        let xport = SinkTransport::new(false);
        let writer = WriterTask::spawn(xport.clone());

        // Cancel before enqueueing so the runner can only see it cancelled.
        let job = WriteJob::new([0xCC; HDR_LEN], vec![]);
        job.cancel();
        writer.enqueue(&job).unwrap();

        let marker = WriteJob::new([0xDD; HDR_LEN], vec![]);
        writer.enqueue(&marker).unwrap();
        marker.wait_done(Deadline::from_ms(1000)).unwrap();

        assert_eq!(*xport.written.lock().unwrap(), [0xDD; HDR_LEN]);
        assert_eq!(job.wait_done(Deadline::from_ms(10)), Err(Error::Cancelled));
        writer.stop_and_flush(Error::BadFd);
    }

    #[test]
    fn write_failure_surfaces_and_poisons() {
        let xport = SinkTransport::new(true);
        let writer = WriterTask::spawn(xport);

        let job = WriteJob::new([0; HDR_LEN], vec![]);
        writer.enqueue(&job).unwrap();
        assert_eq!(job.wait_done(Deadline::from_ms(1000)), Err(Error::BrokenPipe));

        let next = WriteJob::new([0; HDR_LEN], vec![]);
        writer.enqueue(&next).unwrap();
        assert_eq!(next.wait_done(Deadline::from_ms(1000)), Err(Error::BrokenPipe));
        writer.stop_and_flush(Error::BadFd);
    }

    #[test]
    fn payload_reclaimable_after_done() {
        let xport = SinkTransport::new(false);
        let writer = WriterTask::spawn(xport);

        let job = WriteJob::new([0; HDR_LEN], vec![vec![9, 9, 9]]);
        writer.enqueue(&job).unwrap();
        job.wait_done(Deadline::from_ms(1000)).unwrap();
        assert_eq!(job.take_payload(), vec![vec![9, 9, 9]]);
        writer.stop_and_flush(Error::BadFd);
    }

    #[test]
    fn enqueue_after_stop_fails() {
        let writer = WriterTask::spawn(SinkTransport::new(false));
        writer.stop_and_flush(Error::BrokenPipe);
        let job = WriteJob::new([0; HDR_LEN], vec![]);
        assert_eq!(writer.enqueue(&job), Err(Error::BadFd));
    }
}
