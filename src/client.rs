//! Protocol driver for one daemon connection.
//!
//! Every operation exists in both wire forms: an 8-byte binary command
//! when the session upgraded at connect time, otherwise a CRLF text
//! command. Binary exchanges go through the responder's default I/O
//! handle; legacy exchanges hold the client lock for the whole
//! request/response round trip since the text protocol has no
//! correlation ids.
//!
//! Bulk block transfers bypass this module's lock entirely: each
//! block drives its own I/O handle (see `buffer`).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use crate::attr;
use crate::error::{Error, Result};
use crate::mask::ChannelsMask;
use crate::params::ContextParams;
use crate::proto::{BINARY_PROBE, Command, Opcode, legacy, pack_attr_code};
use crate::responder::{Responder, io::IiodIo};
use crate::transport::{NO_TIMEOUT, Transport, read_exact, write_all};

/// Client timeouts use 0 for "never"; transports use 0 for "default".
fn xfer_timeout(timeout_ms: u32) -> u32 {
    if timeout_ms == 0 { NO_TIMEOUT } else { timeout_ms }
}

/// Attribute scope addressing, covering both wire forms.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope<'a> {
    Device,
    Debug,
    Buffer { buf_idx: u16 },
    Channel {
        chn_idx: u16,
        output: bool,
        chn_id: &'a str,
    },
}

/// Target of an attribute operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttrTarget<'a> {
    pub dev_idx: u8,
    pub dev_id: &'a str,
    pub scope: Scope<'a>,
}

/// Result of a trigger query, before device resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TriggerRef {
    None,
    /// Binary servers answer with the device index.
    Index(u8),
    /// Legacy servers answer with the device name.
    Name(String),
}

pub(crate) struct IiodClient {
    xport: Arc<dyn Transport>,
    /// Present iff the session upgraded to the binary protocol.
    responder: Option<Arc<Responder>>,
    lock: Mutex<()>,
    timeout_ms: AtomicU32,
}

impl IiodClient {
    /// Wrap a fresh connection: probe for the binary protocol, then
    /// start the responder when the server accepts it.
    pub fn new(xport: Box<dyn Transport>, params: &ContextParams) -> Result<Self> {
        let xport: Arc<dyn Transport> = Arc::from(xport);
        let timeout_ms = params.timeout_ms;

        let mut binary = false;
        if params.probe_binary {
            write_all(xport.as_ref(), BINARY_PROBE, xfer_timeout(timeout_ms))?;
            let mut line = [0u8; 32];
            let n = xport.read_line(&mut line, xfer_timeout(timeout_ms))?;
            match legacy::parse_integer(&line[..n]) {
                Ok(0) => binary = true,
                // Any error value means "feature absent": stay legacy.
                Ok(_) | Err(_) => {}
            }
        }
        debug!(
            "session established ({} protocol)",
            if binary { "binary" } else { "legacy" }
        );

        let responder = binary.then(|| Responder::new(Arc::clone(&xport), timeout_ms));
        Ok(Self {
            xport,
            responder,
            lock: Mutex::new(()),
            timeout_ms: AtomicU32::new(timeout_ms),
        })
    }

    pub fn is_binary(&self) -> bool {
        self.responder.is_some()
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn responder(&self) -> Result<&Arc<Responder>> {
        self.responder.as_ref().ok_or(Error::NotSupported)
    }

    // ── Exchange plumbing ────────────────────────────────────

    /// Run one binary exchange on the default I/O handle, serialised
    /// with the other metadata operations of this connection.
    fn binary_exec(
        &self,
        cmd: Command,
        payload: Vec<Vec<u8>>,
        resp_bufs: Vec<Vec<u8>>,
    ) -> Result<(i32, Vec<Vec<u8>>)> {
        let responder = self.responder()?;
        let _guard = self.lock.lock().unwrap();
        responder.default_io().exec(cmd, payload, resp_bufs)
    }

    fn binary_exec_simple(&self, cmd: Command) -> Result<i32> {
        self.binary_exec(cmd, Vec::new(), Vec::new())
            .map(|(code, _)| code)
    }

    /// Lock the connection for a legacy text exchange.
    pub(crate) fn legacy(&self) -> LegacyExchange<'_> {
        LegacyExchange {
            xport: self.xport.as_ref(),
            timeout_ms: xfer_timeout(self.timeout_ms()),
            _guard: self.lock.lock().unwrap(),
        }
    }

    // ── Context document ─────────────────────────────────────

    /// Fetch the XML context description.
    pub fn print(&self) -> Result<String> {
        if self.is_binary() {
            let cmd = Command::new(Opcode::Print, 0, 0, attr::BULK_BUF_SIZE as i32);
            let (code, mut bufs) = self.binary_exec(cmd, Vec::new(), vec![vec![
                0;
                attr::BULK_BUF_SIZE
            ]])?;
            let len = code as usize;
            if len > attr::BULK_BUF_SIZE {
                return Err(Error::Io);
            }
            let mut xml = bufs.remove(0);
            xml.truncate(len);
            return String::from_utf8(xml).map_err(|_| Error::Protocol);
        }

        let ex = self.legacy();

        // Compressed first; a server without zstd answers -EINVAL.
        ex.send(&legacy::print(true))?;
        match ex.read_integer()? {
            code if code >= 0 => {
                let compressed = ex.read_payload(code as usize)?;
                let xml = zstd::stream::decode_all(compressed.as_slice())
                    .map_err(|_| Error::Protocol)?;
                return String::from_utf8(xml).map_err(|_| Error::Protocol);
            }
            code => {
                let err = Error::from_wire(code as i32);
                if err != Error::InvalidArg && err != Error::NotSupported {
                    return Err(err);
                }
                debug!("server lacks ZPRINT, falling back to PRINT");
            }
        }

        ex.send(&legacy::print(false))?;
        let code = ex.read_integer()?;
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }
        let xml = ex.read_payload(code as usize)?;
        String::from_utf8(xml).map_err(|_| Error::Protocol)
    }

    /// Legacy protocol handshake: daemon version triple.
    pub fn version(&self) -> Result<(u32, u32, String)> {
        if self.is_binary() {
            return Err(Error::NotSupported);
        }
        let ex = self.legacy();
        ex.send(&legacy::version())?;
        let mut line = [0u8; 64];
        let n = ex.read_line(&mut line)?;
        legacy::parse_version(core::str::from_utf8(&line[..n]).map_err(|_| Error::Protocol)?)
    }

    // ── Timeout ──────────────────────────────────────────────

    /// Update the local default timeout and tell the server to give up
    /// at half of it. Servers that reject the command are tolerated.
    pub fn set_timeout(&self, local_ms: u32) -> Result<()> {
        self.timeout_ms.store(local_ms, Ordering::Relaxed);
        if let Some(responder) = self.responder.as_ref() {
            responder.set_timeout(local_ms);
        }

        let remote_ms = local_ms / 2;
        let result = if self.is_binary() {
            self.binary_exec_simple(Command::new(Opcode::Timeout, 0, 0, remote_ms as i32))
                .map(|_| ())
        } else {
            let ex = self.legacy();
            ex.send(&legacy::timeout(remote_ms))?;
            match ex.read_integer()? {
                code if code >= 0 => Ok(()),
                code => Err(Error::from_wire(code as i32)),
            }
        };

        match result {
            Err(Error::InvalidArg | Error::NotSupported) => Ok(()), // feature absent
            other => other,
        }
    }

    // ── Attributes ───────────────────────────────────────────

    fn read_opcode(scope: Scope<'_>) -> Opcode {
        match scope {
            Scope::Device => Opcode::ReadAttr,
            Scope::Debug => Opcode::ReadDbgAttr,
            Scope::Buffer { .. } => Opcode::ReadBufAttr,
            Scope::Channel { .. } => Opcode::ReadChnAttr,
        }
    }

    fn write_opcode(scope: Scope<'_>) -> Opcode {
        match scope {
            Scope::Device => Opcode::WriteAttr,
            Scope::Debug => Opcode::WriteDbgAttr,
            Scope::Buffer { .. } => Opcode::WriteBufAttr,
            Scope::Channel { .. } => Opcode::WriteChnAttr,
        }
    }

    fn obj_idx(scope: Scope<'_>) -> u16 {
        match scope {
            Scope::Device | Scope::Debug => 0,
            Scope::Buffer { buf_idx } => buf_idx,
            Scope::Channel { chn_idx, .. } => chn_idx,
        }
    }

    fn legacy_scope<'a>(scope: Scope<'a>) -> legacy::AttrScope<'a> {
        match scope {
            Scope::Device => legacy::AttrScope::Device,
            Scope::Debug => legacy::AttrScope::Debug,
            Scope::Buffer { .. } => legacy::AttrScope::Buffer,
            Scope::Channel { output, chn_id, .. } => legacy::AttrScope::Channel {
                output,
                id: chn_id,
            },
        }
    }

    /// Read an attribute value into `dst`; returns the value length.
    /// A value longer than `dst` is discarded and fails with `Io`.
    pub fn attr_read(
        &self,
        target: AttrTarget<'_>,
        attr_idx: u16,
        attr_name: &str,
        dst: &mut [u8],
    ) -> Result<usize> {
        if self.is_binary() {
            let cmd = Command::new(
                Self::read_opcode(target.scope),
                target.dev_idx,
                0,
                pack_attr_code(attr_idx, Self::obj_idx(target.scope)),
            );
            let (code, bufs) = self.binary_exec(cmd, Vec::new(), vec![vec![0; dst.len()]])?;
            let len = code as usize;
            if len > dst.len() {
                return Err(Error::Io);
            }
            dst[..len].copy_from_slice(&bufs[0][..len]);
            return Ok(len);
        }

        let ex = self.legacy();
        ex.send(&legacy::read_attr(
            target.dev_id,
            Self::legacy_scope(target.scope),
            Some(attr_name),
        ))?;
        let code = ex.read_integer()?;
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }

        let len = code as usize;
        if len > dst.len() {
            // Value and its trailing newline are dropped.
            ex.discard(len + 1)?;
            return Err(Error::Io);
        }
        ex.read_exact(&mut dst[..len])?;
        ex.consume_newline()?;
        Ok(len)
    }

    /// Write an attribute value; returns the byte count the server
    /// accepted.
    pub fn attr_write(
        &self,
        target: AttrTarget<'_>,
        attr_idx: u16,
        attr_name: &str,
        data: &[u8],
    ) -> Result<usize> {
        if self.is_binary() {
            let cmd = Command::new(
                Self::write_opcode(target.scope),
                target.dev_idx,
                0,
                pack_attr_code(attr_idx, Self::obj_idx(target.scope)),
            );
            let payload = vec![(data.len() as u64).to_le_bytes().to_vec(), data.to_vec()];
            let code = self
                .binary_exec(cmd, payload, Vec::new())
                .map(|(code, _)| code)?;
            return Ok(code as usize);
        }

        let ex = self.legacy();
        ex.send(&legacy::write_attr(
            target.dev_id,
            Self::legacy_scope(target.scope),
            Some(attr_name),
            data.len(),
        ))?;
        ex.write_exact(data)?;
        let code = ex.read_integer()?;
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }
        Ok(code as usize)
    }

    /// Bulk read of every attribute in a scope, in list order.
    /// Legacy protocol only.
    pub fn attrs_read_all(
        &self,
        target: AttrTarget<'_>,
        count: usize,
    ) -> Result<Vec<Result<Vec<u8>>>> {
        if self.is_binary() {
            return Err(Error::NotSupported);
        }
        let ex = self.legacy();
        ex.send(&legacy::read_attr(
            target.dev_id,
            Self::legacy_scope(target.scope),
            None,
        ))?;
        let code = ex.read_integer()?;
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }
        if code as usize > attr::BULK_BUF_SIZE {
            return Err(Error::NoMem);
        }
        let bulk = ex.read_payload(code as usize)?;
        attr::parse_bulk(&bulk, count)
    }

    /// Bulk write of a scope's attributes, in list order. `None`
    /// entries are skipped. Legacy protocol only.
    pub fn attrs_write_all(
        &self,
        target: AttrTarget<'_>,
        entries: &[Option<&[u8]>],
    ) -> Result<()> {
        if self.is_binary() {
            return Err(Error::NotSupported);
        }
        let bulk = attr::build_bulk(entries)?;

        let ex = self.legacy();
        ex.send(&legacy::write_attr(
            target.dev_id,
            Self::legacy_scope(target.scope),
            None,
            bulk.len(),
        ))?;
        ex.write_exact(&bulk)?;
        let code = ex.read_integer()?;
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }
        Ok(())
    }

    // ── Triggers ─────────────────────────────────────────────

    pub fn get_trigger(&self, dev_idx: u8, dev_id: &str) -> Result<TriggerRef> {
        if self.is_binary() {
            return match self.binary_exec_simple(Command::new(Opcode::GetTrig, dev_idx, 0, 0)) {
                Ok(idx) => Ok(TriggerRef::Index(idx as u8)),
                Err(Error::NotFound) => Ok(TriggerRef::None),
                Err(err) => Err(err),
            };
        }

        let ex = self.legacy();
        ex.send(&legacy::get_trigger(dev_id))?;
        let code = ex.read_integer()?;
        match code {
            0 => Ok(TriggerRef::None),
            code if code < 0 => Err(Error::from_wire(code as i32)),
            len => {
                let name = ex.read_payload(len as usize)?;
                let name = String::from_utf8(name).map_err(|_| Error::Protocol)?;
                Ok(TriggerRef::Name(name))
            }
        }
    }

    /// `trigger = None` clears the device's trigger.
    pub fn set_trigger(
        &self,
        dev_idx: u8,
        dev_id: &str,
        trigger: Option<(&str, u8)>,
    ) -> Result<()> {
        if self.is_binary() {
            let code = trigger.map_or(-1, |(_, idx)| idx as i32);
            self.binary_exec_simple(Command::new(Opcode::SetTrig, dev_idx, 0, code))?;
            return Ok(());
        }

        let ex = self.legacy();
        ex.send(&legacy::set_trigger(dev_id, trigger.map(|(id, _)| id)))?;
        let code = ex.read_integer()?;
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }
        Ok(())
    }

    // ── Kernel queue depth ───────────────────────────────────

    /// Legacy protocol only; the binary protocol sizes queues at
    /// buffer creation.
    pub fn set_kernel_buffers_count(&self, dev_id: &str, count: u32) -> Result<()> {
        if self.is_binary() {
            return Err(Error::NotSupported);
        }
        let ex = self.legacy();
        ex.send(&legacy::set_buffers_count(dev_id, count))?;
        let code = ex.read_integer()?;
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }
        Ok(())
    }

    // ── Buffers ──────────────────────────────────────────────

    /// Create a server-side buffer. The server echoes the mask it
    /// actually honoured, which may be narrower than requested.
    /// The legacy protocol defers everything to `enable_buffer`.
    pub fn create_buffer(&self, dev_idx: u8, buf_idx: u16, mask: &mut ChannelsMask) -> Result<()> {
        if !self.is_binary() {
            return Ok(());
        }

        let wire = mask.to_bytes();
        let cmd = Command::new(Opcode::CreateBuffer, dev_idx, 0, buf_idx as i32);
        let (_, bufs) = self.binary_exec(cmd, vec![wire.clone()], vec![vec![0; wire.len()]])?;
        let echoed = ChannelsMask::from_bytes(&bufs[0])?;
        mask.copy_from(&echoed)?;
        info!("buffer {buf_idx}: created on device {dev_idx} ({} channels)", mask.weight());
        Ok(())
    }

    pub fn enable_buffer(
        &self,
        dev_idx: u8,
        dev_id: &str,
        buf_idx: u16,
        nb_samples: usize,
        mask_text: &str,
        cyclic: bool,
    ) -> Result<()> {
        let code = if self.is_binary() {
            self.binary_exec_simple(Command::new(
                Opcode::EnableBuffer,
                dev_idx,
                0,
                buf_idx as i32,
            ))? as i64
        } else {
            let ex = self.legacy();
            ex.send(&legacy::open(dev_id, nb_samples, mask_text, cyclic))?;
            ex.read_integer()?
        };
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }
        Ok(())
    }

    pub fn disable_buffer(&self, dev_idx: u8, dev_id: &str, buf_idx: u16) -> Result<()> {
        let code = if self.is_binary() {
            self.binary_exec_simple(Command::new(
                Opcode::DisableBuffer,
                dev_idx,
                0,
                buf_idx as i32,
            ))? as i64
        } else {
            let ex = self.legacy();
            ex.send(&legacy::close(dev_id))?;
            ex.read_integer()?
        };
        if code < 0 {
            return Err(Error::from_wire(code as i32));
        }
        Ok(())
    }

    pub fn free_buffer(&self, dev_idx: u8, buf_idx: u16) -> Result<()> {
        if !self.is_binary() {
            return Ok(());
        }
        self.binary_exec_simple(Command::new(Opcode::FreeBuffer, dev_idx, 0, buf_idx as i32))?;
        Ok(())
    }

    // ── Blocks (binary protocol) ─────────────────────────────

    /// Create a block and its dedicated I/O handle, correlated by
    /// `block_idx + 1`. The size is negotiated as a 64-bit payload.
    pub fn create_block(&self, dev_idx: u8, block_idx: u16, size: u64) -> Result<Arc<IiodIo>> {
        let responder = self.responder()?;
        let io = responder.create_io_with_id(block_idx + 1);
        let cmd = Command::new(Opcode::CreateBlock, dev_idx, io.client_id(), block_idx as i32);
        io.exec(cmd, vec![size.to_le_bytes().to_vec()], Vec::new())?;
        Ok(io)
    }

    /// Free a block server-side. Travels on the connection's default
    /// I/O: the block's own stream is disrupted by the preceding
    /// cancel and must not be used.
    pub fn free_block(&self, dev_idx: u8, block_idx: u16) -> Result<()> {
        self.binary_exec_simple(Command::new(
            Opcode::FreeBlock,
            dev_idx,
            0,
            block_idx as i32,
        ))?;
        Ok(())
    }

    // ── Event streams (binary protocol) ──────────────────────

    pub fn create_evstream(&self, dev_idx: u8) -> Result<Arc<IiodIo>> {
        let responder = self.responder()?;
        let io = responder.create_io();
        let cmd = Command::new(Opcode::CreateEvstream, dev_idx, io.client_id(), 0);
        io.exec_simple(cmd)?;
        Ok(io)
    }

    pub fn free_evstream(&self, dev_idx: u8) -> Result<()> {
        self.binary_exec_simple(Command::new(Opcode::FreeEvstream, dev_idx, 0, 0))?;
        Ok(())
    }
}

impl Drop for IiodClient {
    fn drop(&mut self) {
        if self.is_binary() {
            // Responder shutdown (reader + writer join) runs when the
            // last Arc drops.
            return;
        }
        // Polite legacy goodbye; the server closes the connection.
        let _ = write_all(
            self.xport.as_ref(),
            legacy::exit().as_bytes(),
            xfer_timeout(self.timeout_ms()),
        );
    }
}

// ── Legacy exchange guard ────────────────────────────────────

/// One locked request/response round trip on the text protocol.
pub(crate) struct LegacyExchange<'a> {
    xport: &'a dyn Transport,
    timeout_ms: u32,
    _guard: MutexGuard<'a, ()>,
}

impl LegacyExchange<'_> {
    pub fn send(&self, cmd: &str) -> Result<()> {
        write_all(self.xport, cmd.as_bytes(), self.timeout_ms)
    }

    pub fn write_exact(&self, data: &[u8]) -> Result<()> {
        write_all(self.xport, data, self.timeout_ms)
    }

    /// Read the integer line heading a response.
    pub fn read_integer(&self) -> Result<i64> {
        let mut line = [0u8; 32];
        let n = self.xport.read_line(&mut line, self.timeout_ms)?;
        legacy::parse_integer(&line[..n])
    }

    pub fn read_line(&self, buf: &mut [u8]) -> Result<usize> {
        self.xport.read_line(buf, self.timeout_ms)
    }

    pub fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        read_exact(self.xport, buf, self.timeout_ms)
    }

    /// Read a length-prefixed payload and its trailing newline.
    pub fn read_payload(&self, len: usize) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload)?;
        self.consume_newline()?;
        Ok(payload)
    }

    pub fn discard(&self, count: usize) -> Result<()> {
        self.xport.discard(count, self.timeout_ms)?;
        Ok(())
    }

    /// Consume the `\n` terminating a payload.
    pub fn consume_newline(&self) -> Result<()> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        if byte[0] != b'\n' {
            return Err(Error::Protocol);
        }
        Ok(())
    }
}
