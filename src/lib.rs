//! Client-side runtime for a remote Industrial I/O daemon.
//!
//! Exposes the typed hierarchy of contexts, devices, channels,
//! attributes, buffers and blocks, and multiplexes access to it over a
//! choice of transports (TCP, serial). Two engines do the heavy
//! lifting: the protocol client (legacy text and binary framings on
//! the same wire, with response correlation, cancellation and
//! timeouts) and the pure sample-format codec.

#![deny(unused_must_use)]

pub mod attr;
pub mod buffer;
pub mod context;
pub mod event;
pub mod format;
pub mod mask;
pub mod params;
pub mod proto;
pub mod responder;
pub mod transport;
pub mod uri;
pub mod xml;

mod client;
mod error;

pub use buffer::{Block, Buffer, BufferParams};
pub use context::{Channel, Context, Device};
pub use error::{Error, Result};
pub use event::{Event, EventStream};
pub use format::DataFormat;
pub use mask::ChannelsMask;
pub use params::ContextParams;
