//! Event streams — asynchronous device event delivery.
//!
//! Binary protocol only. A stream holds its own I/O handle; each
//! `READ_EVENT` request is answered when the device next raises an
//! event. The PDU is 16 bytes, little-endian:
//!
//! ```text
//! ┌──────────────────┬────────────────────────┐
//! │ event id (u64)   │ timestamp ns (i64)     │
//! └──────────────────┴────────────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::context::Device;
use crate::error::{Error, Result};
use crate::proto::{Command, Opcode};
use crate::responder::io::IiodIo;

/// Size of one event PDU on the wire.
const EVENT_PDU_LEN: usize = 16;

/// One device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    id: u64,
    timestamp: i64,
}

impl Event {
    /// Kernel event code, encoding channel, type and direction.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Event timestamp in nanoseconds, or 0 when the device does not
    /// timestamp events.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EVENT_PDU_LEN {
            return Err(Error::Protocol);
        }
        Ok(Self {
            id: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            timestamp: i64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        })
    }
}

/// Reader for a device's event queue. One per device at a time.
pub struct EventStream<'a> {
    dev: Device<'a>,
    io: Arc<IiodIo>,
    /// A READ_EVENT request is outstanding.
    pending: bool,
}

impl<'a> EventStream<'a> {
    pub(crate) fn new(dev: Device<'a>) -> Result<Self> {
        if dev.evstream_flag().swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        match dev.context().main_client().create_evstream(dev.wire_idx()) {
            Ok(io) => Ok(Self {
                dev,
                io,
                pending: false,
            }),
            Err(err) => {
                dev.evstream_flag().store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    pub fn device(&self) -> Device<'a> {
        self.dev
    }

    /// Read the next event. Non-blocking polls the outstanding request
    /// and fails with `Busy` while no event has arrived. A timed-out
    /// blocking read abandons the request; the response, if it ever
    /// comes, is drained as an orphan.
    pub fn read_event(&mut self, nonblock: bool) -> Result<Event> {
        if !self.pending {
            let cmd = Command::new(
                Opcode::ReadEvent,
                self.dev.wire_idx(),
                self.io.client_id(),
                0,
            );
            self.io.get_response_async(vec![vec![0u8; EVENT_PDU_LEN]])?;
            if let Err(err) = self.io.send_command_async(cmd, Vec::new()) {
                self.io.cancel();
                return Err(err);
            }
            self.pending = true;
        }

        let code = if nonblock {
            match self.io.try_response() {
                Ok(None) => return Err(Error::Busy),
                Ok(Some(code)) => Ok(code),
                Err(err) => Err(err),
            }
        } else {
            self.io.wait_for_response()
        };

        match code {
            Ok(_) => {
                self.pending = false;
                let bufs = self.io.take_response_buffers();
                Event::from_wire(bufs.first().map_or(&[][..], Vec::as_slice))
            }
            Err(err) => {
                self.pending = false;
                Err(err)
            }
        }
    }
}

impl Drop for EventStream<'_> {
    fn drop(&mut self) {
        self.io.cancel();
        let _ = self.dev.context().main_client().free_evstream(self.dev.wire_idx());
        self.dev.evstream_flag().store(false, Ordering::Release);
    }
}
