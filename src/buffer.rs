//! Buffers and blocks — the bulk data path.
//!
//! A buffer is a server-side sample queue bound to one device. Every
//! buffer opens a *dedicated* connection: block I/O handles correlate
//! by `block_idx + 1`, which is only collision-free within a private
//! client-id namespace, and bulk transfers must not head-of-line-block
//! the context's metadata connection.
//!
//! Block lifecycle: create (size negotiation) → enqueue (one transfer
//! in one direction) → dequeue (status) → free. Enqueue and dequeue of
//! different blocks never block each other; each block drives its own
//! I/O handle.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::client::IiodClient;
use crate::context::Device;
use crate::error::{Error, Result};
use crate::mask::ChannelsMask;
use crate::proto::{Command, Opcode};
use crate::proto::legacy;
use crate::responder::io::IiodIo;

/// Creation-time knobs.
#[derive(Debug, Clone, Copy)]
pub struct BufferParams {
    /// Queue depth in samples, used by the legacy `OPEN` emulation.
    /// The binary protocol sizes queues per block instead.
    pub nb_samples: usize,
    /// Cyclic buffers repeat their last enqueued block server-side.
    pub cyclic: bool,
}

impl Default for BufferParams {
    fn default() -> Self {
        Self {
            nb_samples: 4096,
            cyclic: false,
        }
    }
}

/// A server-side sample queue bound to one device.
pub struct Buffer<'a> {
    dev: Device<'a>,
    idx: u16,
    client: IiodClient,
    mask: Mutex<ChannelsMask>,
    /// Any output channel enabled makes this a TX buffer.
    is_output: bool,
    enabled: AtomicBool,
    /// At most one enablement operation in flight.
    enable_lock: Mutex<()>,
    next_block_idx: AtomicU16,
    params: BufferParams,
}

impl<'a> Buffer<'a> {
    pub(crate) fn new(dev: Device<'a>, mask: ChannelsMask, params: BufferParams) -> Result<Self> {
        let ctx = dev.context();
        if mask.nb_words() != dev.scan_mask_words() || mask.is_empty() {
            return Err(Error::InvalidArg);
        }
        let is_output = dev.mask_has_output(&mask);

        let idx = ctx.alloc_buffer_idx();
        let xport = ctx.connector().connect()?;
        let client = IiodClient::new(xport, ctx.params())?;

        let mut mask = mask;
        client.create_buffer(dev.wire_idx(), idx, &mut mask)?;

        Ok(Self {
            dev,
            idx,
            client,
            mask: Mutex::new(mask),
            is_output,
            enabled: AtomicBool::new(false),
            enable_lock: Mutex::new(()),
            next_block_idx: AtomicU16::new(0),
            params,
        })
    }

    pub fn device(&self) -> Device<'a> {
        self.dev
    }

    /// Stable buffer index within the context.
    pub fn idx(&self) -> u16 {
        self.idx
    }

    /// The channel mask the server honoured (possibly narrower than
    /// requested).
    pub fn mask(&self) -> ChannelsMask {
        self.mask.lock().unwrap().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Bytes of one complete scan with this buffer's mask.
    pub fn sample_size(&self) -> Result<usize> {
        self.dev.sample_size(&self.mask())
    }

    /// Start streaming. Fails with `Busy` when already enabled.
    pub fn enable(&self) -> Result<()> {
        let _op = self.enable_lock.lock().unwrap();
        if self.is_enabled() {
            return Err(Error::Busy);
        }
        let mask_text = self.mask.lock().unwrap().to_text();
        self.client.enable_buffer(
            self.dev.wire_idx(),
            self.dev.id(),
            self.idx,
            self.params.nb_samples,
            &mask_text,
            self.params.cyclic,
        )?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop streaming. Fails with `BadFd` when not enabled.
    pub fn disable(&self) -> Result<()> {
        let _op = self.enable_lock.lock().unwrap();
        if !self.is_enabled() {
            return Err(Error::BadFd);
        }
        self.client
            .disable_buffer(self.dev.wire_idx(), self.dev.id(), self.idx)?;
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    /// Allocate a block of `size` bytes and register it server-side.
    pub fn create_block(&self, size: usize) -> Result<Block<'a, '_>> {
        if size == 0 {
            return Err(Error::InvalidArg);
        }
        let idx = self.next_block_idx.fetch_add(1, Ordering::Relaxed);

        let io = if self.client.is_binary() {
            Some(self.client.create_block(self.dev.wire_idx(), idx, size as u64)?)
        } else {
            None
        };

        debug!("buffer {}: block {idx} created ({size} bytes)", self.idx);
        Ok(Block {
            buffer: self,
            idx,
            size,
            data: Some(vec![0u8; size]),
            io,
            enqueued: false,
            bytes_used: 0,
            legacy_result: None,
        })
    }

    pub(crate) fn update_mask(&self, new_mask: &ChannelsMask) {
        let mut mask = self.mask.lock().unwrap();
        if mask.copy_from(new_mask).is_err() {
            warn!("buffer {}: server mask has wrong word count, ignoring", self.idx);
        }
    }

    pub(crate) fn client(&self) -> &IiodClient {
        &self.client
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        if self.is_enabled() {
            let _ = self
                .client
                .disable_buffer(self.dev.wire_idx(), self.dev.id(), self.idx);
        }
        let _ = self.client.free_buffer(self.dev.wire_idx(), self.idx);
    }
}

// ── Blocks ───────────────────────────────────────────────────

/// One unit of bulk data queued into a buffer.
///
/// The data region is inaccessible while the block is enqueued; the
/// transfer owns it until `dequeue` completes.
pub struct Block<'a, 'b> {
    buffer: &'b Buffer<'a>,
    idx: u16,
    size: usize,
    data: Option<Vec<u8>>,
    /// Dedicated I/O handle, correlated by `idx + 1`. Absent on
    /// legacy connections.
    io: Option<Arc<IiodIo>>,
    enqueued: bool,
    bytes_used: usize,
    /// The legacy emulation transfers synchronously at enqueue time
    /// and parks the outcome here for dequeue.
    legacy_result: Option<Result<usize>>,
}

impl<'a, 'b> Block<'a, 'b> {
    pub fn buffer(&self) -> &'b Buffer<'a> {
        self.buffer
    }

    pub fn idx(&self) -> u16 {
        self.idx
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes transferred by the last completed dequeue.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn data(&self) -> Result<&[u8]> {
        match (&self.data, self.enqueued) {
            (Some(data), false) => Ok(data),
            _ => Err(Error::Busy),
        }
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match (&mut self.data, self.enqueued) {
            (Some(data), false) => Ok(data),
            _ => Err(Error::Busy),
        }
    }

    /// Queue the block for transfer. `bytes_used` defaults to the full
    /// size; it must be non-zero and no larger than the block.
    pub fn enqueue(&mut self, bytes_used: Option<usize>, cyclic: bool) -> Result<()> {
        if self.enqueued {
            return Err(Error::Busy);
        }
        let bytes_used = bytes_used.unwrap_or(self.size);
        if bytes_used == 0 || bytes_used > self.size {
            return Err(Error::InvalidArg);
        }

        match self.io.clone() {
            Some(io) => self.enqueue_binary(&io, bytes_used, cyclic),
            None => self.enqueue_legacy(bytes_used),
        }
    }

    fn enqueue_binary(&mut self, io: &Arc<IiodIo>, bytes_used: usize, cyclic: bool) -> Result<()> {
        let tx = self.buffer.is_output;
        let opcode = if cyclic {
            Opcode::EnqueueBlockCyclic
        } else {
            Opcode::TransferBlock
        };
        let cmd = Command::new(
            opcode,
            self.buffer.dev.wire_idx(),
            io.client_id(),
            0,
        );

        let mut data = self.data.take().ok_or(Error::Busy)?;
        let header = (bytes_used as u64).to_le_bytes().to_vec();

        let result = if tx {
            // Outbound: ship exactly bytes_used bytes; the response is
            // a bare acknowledgement.
            data.truncate(bytes_used);
            io.get_response_async(Vec::new())
                .and_then(|()| io.send_command_async(cmd, vec![header, data]))
        } else {
            // Inbound: the response payload lands straight in the
            // block's data region.
            io.get_response_async(vec![data])
                .and_then(|()| io.send_command_async(cmd, vec![header]))
        };

        match result {
            Ok(()) => {
                self.enqueued = true;
                Ok(())
            }
            Err(err) => {
                // Recover the data region before surfacing the error.
                io.cancel();
                self.reclaim(io);
                Err(err)
            }
        }
    }

    fn enqueue_legacy(&mut self, bytes_used: usize) -> Result<()> {
        let buffer = self.buffer;
        let data = self.data.as_mut().ok_or(Error::Busy)?;
        let dev_id = buffer.dev.id();

        let result = if buffer.is_output {
            let ex = buffer.client().legacy();
            (|| {
                ex.send(&legacy::write_buf(dev_id, bytes_used))?;
                let open = ex.read_integer()?;
                if open < 0 {
                    return Err(Error::from_wire(open as i32));
                }
                ex.write_exact(&data[..bytes_used])?;
                let accepted = ex.read_integer()?;
                if accepted < 0 {
                    return Err(Error::from_wire(accepted as i32));
                }
                Ok(accepted as usize)
            })()
        } else {
            let nb_words = buffer.dev.scan_mask_words();
            let ex = buffer.client().legacy();
            (|| {
                ex.send(&legacy::read_buf(dev_id, bytes_used))?;
                let mut offset = 0usize;
                loop {
                    let chunk = ex.read_integer()?;
                    if chunk < 0 {
                        return Err(Error::from_wire(chunk as i32));
                    }
                    if chunk == 0 {
                        return Ok(offset);
                    }
                    // Each chunk restates the honoured mask.
                    let mut line = vec![0u8; nb_words * 8 + 2];
                    let n = ex.read_line(&mut line)?;
                    let text = core::str::from_utf8(&line[..n]).map_err(|_| Error::Protocol)?;
                    let mask = ChannelsMask::from_text(text, nb_words)?;

                    let chunk = chunk as usize;
                    if offset + chunk > data.len() {
                        return Err(Error::Protocol);
                    }
                    ex.read_exact(&mut data[offset..offset + chunk])?;
                    offset += chunk;
                    buffer.update_mask(&mask);
                }
            })()
        };

        // The exchange already completed; dequeue just reports it.
        self.enqueued = true;
        self.legacy_result = Some(result);
        Ok(())
    }

    /// Wait for the transfer to finish and release the data region.
    /// Non-blocking polls instead, failing with `Busy` while the
    /// transfer is still in flight.
    pub fn dequeue(&mut self, nonblock: bool) -> Result<usize> {
        if !self.enqueued {
            return Err(Error::BadFd);
        }

        let Some(io) = self.io.clone() else {
            // Legacy: the exchange ran synchronously at enqueue.
            self.enqueued = false;
            let result = self.legacy_result.take().unwrap_or(Err(Error::BadFd));
            if let Ok(n) = result {
                self.bytes_used = n;
            }
            return result;
        };

        let code = if nonblock {
            if !io.command_done() {
                return Err(Error::Busy);
            }
            match io.try_response() {
                Ok(None) => return Err(Error::Busy),
                Ok(Some(code)) => Ok(code),
                Err(err) => Err(err),
            }
        } else {
            io.wait_for_command_done().and_then(|()| io.wait_for_response())
        };

        match code {
            Ok(code) => {
                self.reclaim(&io);
                self.enqueued = false;
                self.bytes_used = code as usize;
                Ok(code as usize)
            }
            // Still pending: the caller may retry the dequeue.
            Err(err @ (Error::TimedOut | Error::Busy)) => Err(err),
            Err(err) => {
                // Definitive failure; the transfer is over.
                self.reclaim(&io);
                self.enqueued = false;
                Err(err)
            }
        }
    }

    /// Pull the data region back out of the I/O handle.
    fn reclaim(&mut self, io: &Arc<IiodIo>) {
        if self.data.is_some() {
            return;
        }
        // TX parked [length header, data] in the write token; RX
        // parked [data] in the response buffers. Either way the data
        // region is the last element.
        let mut bufs = if self.buffer.is_output {
            io.take_request_payload()
        } else {
            io.take_response_buffers()
        };
        let mut data = bufs.pop().unwrap_or_default();
        data.resize(self.size, 0);
        self.data = Some(data);
    }
}

impl Drop for Block<'_, '_> {
    fn drop(&mut self) {
        if let Some(io) = self.io.take() {
            // Cancel outstanding I/O first; the server is then told
            // through the buffer's main I/O, because this block's own
            // stream is disrupted by the cancel.
            io.cancel();
            if let Err(err) = self
                .buffer
                .client()
                .free_block(self.buffer.dev.wire_idx(), self.idx)
            {
                debug!("block {}: free failed: {err}", self.idx);
            }
        }
    }
}
