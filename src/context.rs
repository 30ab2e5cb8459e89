//! Context, device and channel object graph.
//!
//! The context exclusively owns its devices; devices exclusively own
//! their channels. Back-navigation uses non-owning handles (an index
//! into the context's device table plus a borrow of the context), so
//! the graph is cyclic to the user but acyclic in ownership. A trigger
//! is likewise held as a device index, resolved to a handle on access.
//!
//! Bootstrap: connect → protocol probe → context document fetch → XML
//! collaborator → object graph → channel finalisation → scale/offset
//! back-fill.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use log::{debug, info};

use crate::attr;
use crate::buffer::{Buffer, BufferParams};
use crate::client::{AttrTarget, IiodClient, Scope, TriggerRef};
use crate::error::{Error, Result};
use crate::event::EventStream;
use crate::format::DataFormat;
use crate::mask::ChannelsMask;
use crate::params::ContextParams;
use crate::transport::Connector;
use crate::uri::Uri;
use crate::xml::ContextXmlParser;

/// The binary wire addresses devices with one byte.
const MAX_DEVICES: usize = 256;

pub(crate) struct ChannelData {
    pub id: String,
    pub name: Option<String>,
    pub is_output: bool,
    pub is_scan_element: bool,
    /// Logical scan index; -1 when not a scan element. May repeat
    /// within a device when shifts differ.
    pub index: i64,
    /// Dense position among the device's scan elements, assigned at
    /// finalisation.
    pub number: Option<u32>,
    pub format: DataFormat,
    pub attrs: Vec<String>,
}

pub(crate) struct DeviceData {
    pub id: String,
    pub name: Option<String>,
    pub label: Option<String>,
    pub channels: Vec<ChannelData>,
    pub attrs: Vec<String>,
    pub debug_attrs: Vec<String>,
    pub buffer_attrs: Vec<String>,
    pub scan_count: usize,
    pub evstream_active: AtomicBool,
}

/// The root object: one daemon connection and everything it describes.
pub struct Context {
    name: &'static str,
    description: String,
    xml: String,
    attrs: Vec<(String, String)>,
    devices: Vec<DeviceData>,
    client: IiodClient,
    connector: Connector,
    params: ContextParams,
    next_buf_idx: AtomicU16,
}

impl Context {
    /// Connect to `uri` and build the context it describes.
    pub fn from_uri(
        uri: &str,
        params: ContextParams,
        parser: &dyn ContextXmlParser,
    ) -> Result<Self> {
        let uri = Uri::parse(uri, params.serial_baud)?;
        let connector = Connector::new(uri, params.timeout_ms);
        Self::bootstrap(connector, params, parser)
    }

    /// Re-create a fresh context over the same URI.
    pub fn clone_context(&self, parser: &dyn ContextXmlParser) -> Result<Self> {
        Self::bootstrap(self.connector.clone(), self.params.clone(), parser)
    }

    fn bootstrap(
        connector: Connector,
        params: ContextParams,
        parser: &dyn ContextXmlParser,
    ) -> Result<Self> {
        let xport = connector.connect()?;
        let client = IiodClient::new(xport, &params)?;

        let xml = client.print()?;
        let desc = parser.parse(&xml)?;
        let mut devices = build_devices(desc.devices)?;

        if params.backfill_scale_offset {
            backfill_scale_offset(&client, &mut devices);
        }

        let name = match connector.uri() {
            Uri::Ip { .. } => "network",
            Uri::Serial { .. } => "serial",
            Uri::Usb { .. } => "usb",
            Uri::Local => "local",
        };

        let mut attrs = connector.uri().context_attrs();
        attrs.extend(desc.attrs);

        info!(
            "context '{name}' created: {} devices, {} protocol",
            devices.len(),
            if client.is_binary() { "binary" } else { "legacy" }
        );

        Ok(Self {
            name,
            description: desc.description,
            xml,
            attrs,
            devices,
            client,
            connector,
            params,
            next_buf_idx: AtomicU16::new(0),
        })
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The raw context document the daemon served.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// Context attributes in presentation order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn devices_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> impl Iterator<Item = Device<'_>> {
        (0..self.devices.len()).map(|idx| Device { ctx: self, idx })
    }

    pub fn device(&self, idx: usize) -> Option<Device<'_>> {
        (idx < self.devices.len()).then_some(Device { ctx: self, idx })
    }

    /// Look up a device by id, name or label.
    pub fn find_device(&self, needle: &str) -> Option<Device<'_>> {
        self.devices().find(|dev| {
            let data = dev.data();
            data.id == needle
                || data.name.as_deref() == Some(needle)
                || data.label.as_deref() == Some(needle)
        })
    }

    /// Update the local default timeout; the server is told to give up
    /// at half of it so it always fails first.
    pub fn set_timeout(&self, timeout_ms: u32) -> Result<()> {
        self.client.set_timeout(timeout_ms)
    }

    pub fn timeout_ms(&self) -> u32 {
        self.client.timeout_ms()
    }

    /// Daemon version triple. Legacy-protocol servers only.
    pub fn server_version(&self) -> Result<(u32, u32, String)> {
        self.client.version()
    }

    // ── Internal plumbing ────────────────────────────────────

    pub(crate) fn main_client(&self) -> &IiodClient {
        &self.client
    }

    pub(crate) fn connector(&self) -> &Connector {
        &self.connector
    }

    pub(crate) fn params(&self) -> &ContextParams {
        &self.params
    }

    pub(crate) fn alloc_buffer_idx(&self) -> u16 {
        self.next_buf_idx.fetch_add(1, Ordering::Relaxed)
    }
}

// ── Device handle ────────────────────────────────────────────

/// Non-owning handle to one device of a context.
#[derive(Clone, Copy)]
pub struct Device<'a> {
    ctx: &'a Context,
    idx: usize,
}

impl<'a> Device<'a> {
    pub(crate) fn data(&self) -> &'a DeviceData {
        &self.ctx.devices[self.idx]
    }

    pub fn context(&self) -> &'a Context {
        self.ctx
    }

    /// Position in the context's device table.
    pub fn index(&self) -> usize {
        self.idx
    }

    pub(crate) fn wire_idx(&self) -> u8 {
        self.idx as u8
    }

    pub fn id(&self) -> &'a str {
        &self.data().id
    }

    pub fn name(&self) -> Option<&'a str> {
        self.data().name.as_deref()
    }

    pub fn label(&self) -> Option<&'a str> {
        self.data().label.as_deref()
    }

    pub fn is_trigger(&self) -> bool {
        // Triggers carry no channels and no scan elements.
        self.id().starts_with("trigger")
    }

    // ── Channels ─────────────────────────────────────────────

    pub fn channels_count(&self) -> usize {
        self.data().channels.len()
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel<'a>> + use<'a> {
        let ctx = self.ctx;
        let dev_idx = self.idx;
        (0..self.data().channels.len()).map(move |idx| Channel { ctx, dev_idx, idx })
    }

    pub fn channel(&self, idx: usize) -> Option<Channel<'a>> {
        (idx < self.data().channels.len()).then_some(Channel {
            ctx: self.ctx,
            dev_idx: self.idx,
            idx,
        })
    }

    /// Look up a channel by id or name and direction.
    pub fn find_channel(&self, needle: &str, output: bool) -> Option<Channel<'a>> {
        self.channels().find(|chn| {
            let data = chn.data();
            data.is_output == output
                && (data.id == needle || data.name.as_deref() == Some(needle))
        })
    }

    /// Empty mask sized for this device's scan elements.
    pub fn create_mask(&self) -> ChannelsMask {
        ChannelsMask::new(self.data().scan_count)
    }

    pub(crate) fn scan_mask_words(&self) -> usize {
        self.create_mask().nb_words()
    }

    pub(crate) fn mask_has_output(&self, mask: &ChannelsMask) -> bool {
        self.data().channels.iter().any(|chn| {
            chn.is_output
                && chn
                    .number
                    .is_some_and(|n| mask.test_bit(n as usize))
        })
    }

    /// Bytes of one complete scan under `mask`. Each enabled channel
    /// aligns to its own storage width.
    pub fn sample_size(&self, mask: &ChannelsMask) -> Result<usize> {
        scan_geometry(self.data(), mask, None).map(|(size, _)| size)
    }

    // ── Attributes ───────────────────────────────────────────

    pub fn attrs(&self) -> &'a [String] {
        &self.data().attrs
    }

    pub fn debug_attrs(&self) -> &'a [String] {
        &self.data().debug_attrs
    }

    pub fn buffer_attrs(&self) -> &'a [String] {
        &self.data().buffer_attrs
    }

    fn target(&self, scope: Scope<'a>) -> AttrTarget<'a> {
        AttrTarget {
            dev_idx: self.wire_idx(),
            dev_id: self.id(),
            scope,
        }
    }

    fn scoped_read(
        &self,
        scope: Scope<'a>,
        list: &[String],
        name: &str,
        dst: &mut [u8],
    ) -> Result<usize> {
        let idx = find_attr(list, name)?;
        self.ctx
            .client
            .attr_read(self.target(scope), idx, name, dst)
    }

    fn scoped_write(
        &self,
        scope: Scope<'a>,
        list: &[String],
        name: &str,
        data: &[u8],
    ) -> Result<usize> {
        let idx = find_attr(list, name)?;
        self.ctx
            .client
            .attr_write(self.target(scope), idx, name, data)
    }

    pub fn attr_read(&self, name: &str, dst: &mut [u8]) -> Result<usize> {
        self.scoped_read(Scope::Device, &self.data().attrs, name, dst)
    }

    pub fn attr_read_str(&self, name: &str) -> Result<String> {
        read_str(|dst| self.attr_read(name, dst))
    }

    pub fn attr_read_bool(&self, name: &str) -> Result<bool> {
        attr::parse_bool(&self.attr_read_str(name)?)
    }

    pub fn attr_read_longlong(&self, name: &str) -> Result<i64> {
        attr::parse_longlong(&self.attr_read_str(name)?)
    }

    pub fn attr_read_double(&self, name: &str) -> Result<f64> {
        attr::parse_double(&self.attr_read_str(name)?)
    }

    pub fn attr_write(&self, name: &str, data: &[u8]) -> Result<usize> {
        self.scoped_write(Scope::Device, &self.data().attrs, name, data)
    }

    /// String writes ship the terminating NUL, as the daemon expects.
    pub fn attr_write_str(&self, name: &str, value: &str) -> Result<usize> {
        self.attr_write(name, &with_nul(value))
    }

    pub fn attr_write_bool(&self, name: &str, value: bool) -> Result<usize> {
        self.attr_write_str(name, attr::format_bool(value))
    }

    pub fn attr_write_longlong(&self, name: &str, value: i64) -> Result<usize> {
        self.attr_write_str(name, &attr::format_longlong(value))
    }

    pub fn attr_write_double(&self, name: &str, value: f64) -> Result<usize> {
        self.attr_write_str(name, &attr::format_double(value))
    }

    pub fn debug_attr_read(&self, name: &str, dst: &mut [u8]) -> Result<usize> {
        self.scoped_read(Scope::Debug, &self.data().debug_attrs, name, dst)
    }

    pub fn debug_attr_read_str(&self, name: &str) -> Result<String> {
        read_str(|dst| self.debug_attr_read(name, dst))
    }

    pub fn debug_attr_write(&self, name: &str, data: &[u8]) -> Result<usize> {
        self.scoped_write(Scope::Debug, &self.data().debug_attrs, name, data)
    }

    pub fn buffer_attr_read(&self, name: &str, buf_idx: u16, dst: &mut [u8]) -> Result<usize> {
        self.scoped_read(
            Scope::Buffer { buf_idx },
            &self.data().buffer_attrs,
            name,
            dst,
        )
    }

    pub fn buffer_attr_write(&self, name: &str, buf_idx: u16, data: &[u8]) -> Result<usize> {
        self.scoped_write(
            Scope::Buffer { buf_idx },
            &self.data().buffer_attrs,
            name,
            data,
        )
    }

    /// Bulk read of every device attribute, in list order. Legacy
    /// protocol only.
    pub fn attrs_read_all(&self) -> Result<Vec<(String, Result<String>)>> {
        let values = self
            .ctx
            .client
            .attrs_read_all(self.target(Scope::Device), self.data().attrs.len())?;
        Ok(self
            .data()
            .attrs
            .iter()
            .zip(values)
            .map(|(name, value)| {
                let value = value.map(|bytes| trim_attr_value(&bytes));
                (name.clone(), value)
            })
            .collect())
    }

    /// Bulk write of device attributes by name. Legacy protocol only.
    pub fn attrs_write_all(&self, entries: &[(&str, &str)]) -> Result<()> {
        let attrs = &self.data().attrs;
        let mut values: Vec<Option<Vec<u8>>> = vec![None; attrs.len()];
        for (name, value) in entries {
            let idx = find_attr(attrs, name)? as usize;
            values[idx] = Some(value.as_bytes().to_vec());
        }
        let borrowed: Vec<Option<&[u8]>> =
            values.iter().map(|v| v.as_deref()).collect();
        self.ctx
            .client
            .attrs_write_all(self.target(Scope::Device), &borrowed)
    }

    // ── Trigger ──────────────────────────────────────────────

    /// The device currently driving this device's sampling, if any.
    pub fn trigger(&self) -> Result<Option<Device<'a>>> {
        match self.ctx.client.get_trigger(self.wire_idx(), self.id())? {
            TriggerRef::None => Ok(None),
            TriggerRef::Index(idx) => self
                .ctx
                .device(idx as usize)
                .map(Some)
                .ok_or(Error::Protocol),
            TriggerRef::Name(name) => self
                .ctx
                .find_device(&name)
                .map(Some)
                .ok_or(Error::NotFound),
        }
    }

    /// `None` clears the trigger.
    pub fn set_trigger(&self, trigger: Option<&Device<'_>>) -> Result<()> {
        self.ctx.client.set_trigger(
            self.wire_idx(),
            self.id(),
            trigger.map(|t| (t.id(), t.wire_idx())),
        )
    }

    // ── Streaming ────────────────────────────────────────────

    pub fn create_buffer(&self, mask: ChannelsMask, params: BufferParams) -> Result<Buffer<'a>> {
        Buffer::new(*self, mask, params)
    }

    pub fn create_event_stream(&self) -> Result<EventStream<'a>> {
        EventStream::new(*self)
    }

    pub(crate) fn evstream_flag(&self) -> &'a AtomicBool {
        &self.data().evstream_active
    }

    /// Kernel-side queue depth. Legacy protocol only.
    pub fn set_kernel_buffers_count(&self, count: u32) -> Result<()> {
        self.ctx.client.set_kernel_buffers_count(self.id(), count)
    }
}

// ── Channel handle ───────────────────────────────────────────

/// Non-owning handle to one channel of a device.
#[derive(Clone, Copy)]
pub struct Channel<'a> {
    ctx: &'a Context,
    dev_idx: usize,
    idx: usize,
}

impl<'a> Channel<'a> {
    pub(crate) fn data(&self) -> &'a ChannelData {
        &self.ctx.devices[self.dev_idx].channels[self.idx]
    }

    pub fn device(&self) -> Device<'a> {
        Device {
            ctx: self.ctx,
            idx: self.dev_idx,
        }
    }

    pub fn id(&self) -> &'a str {
        &self.data().id
    }

    pub fn name(&self) -> Option<&'a str> {
        self.data().name.as_deref()
    }

    pub fn is_output(&self) -> bool {
        self.data().is_output
    }

    pub fn is_scan_element(&self) -> bool {
        self.data().is_scan_element
    }

    /// Logical scan index; -1 when not a scan element.
    pub fn index(&self) -> i64 {
        self.data().index
    }

    /// Dense scan position assigned at finalisation.
    pub fn number(&self) -> Option<u32> {
        self.data().number
    }

    pub fn format(&self) -> &'a DataFormat {
        &self.data().format
    }

    pub fn attrs(&self) -> &'a [String] {
        &self.data().attrs
    }

    fn scope(&self) -> Scope<'a> {
        Scope::Channel {
            chn_idx: self.idx as u16,
            output: self.is_output(),
            chn_id: self.id(),
        }
    }

    fn target(&self) -> AttrTarget<'a> {
        AttrTarget {
            dev_idx: self.dev_idx as u8,
            dev_id: &self.ctx.devices[self.dev_idx].id,
            scope: self.scope(),
        }
    }

    pub fn attr_read(&self, name: &str, dst: &mut [u8]) -> Result<usize> {
        let idx = find_attr(&self.data().attrs, name)?;
        self.ctx.client.attr_read(self.target(), idx, name, dst)
    }

    pub fn attr_read_str(&self, name: &str) -> Result<String> {
        read_str(|dst| self.attr_read(name, dst))
    }

    pub fn attr_read_bool(&self, name: &str) -> Result<bool> {
        attr::parse_bool(&self.attr_read_str(name)?)
    }

    pub fn attr_read_longlong(&self, name: &str) -> Result<i64> {
        attr::parse_longlong(&self.attr_read_str(name)?)
    }

    pub fn attr_read_double(&self, name: &str) -> Result<f64> {
        attr::parse_double(&self.attr_read_str(name)?)
    }

    pub fn attr_write(&self, name: &str, data: &[u8]) -> Result<usize> {
        let idx = find_attr(&self.data().attrs, name)?;
        self.ctx.client.attr_write(self.target(), idx, name, data)
    }

    pub fn attr_write_str(&self, name: &str, value: &str) -> Result<usize> {
        self.attr_write(name, &with_nul(value))
    }

    pub fn attr_write_bool(&self, name: &str, value: bool) -> Result<usize> {
        self.attr_write_str(name, attr::format_bool(value))
    }

    pub fn attr_write_longlong(&self, name: &str, value: i64) -> Result<usize> {
        self.attr_write_str(name, &attr::format_longlong(value))
    }

    pub fn attr_write_double(&self, name: &str, value: f64) -> Result<usize> {
        self.attr_write_str(name, &attr::format_double(value))
    }

    // ── Sample access ────────────────────────────────────────

    /// De-mux this channel's samples out of `src`, one interleaved
    /// scan buffer captured under `mask`. Returns bytes written to
    /// `dst`. Decodes to host representation unless `raw`.
    pub fn read_samples(
        &self,
        mask: &ChannelsMask,
        src: &[u8],
        dst: &mut [u8],
        raw: bool,
    ) -> Result<usize> {
        let (step, offset) = self.geometry(mask)?;
        Ok(crate::format::read_samples(
            &self.data().format,
            dst,
            src,
            offset,
            step,
            raw,
        ))
    }

    /// Mux samples from `src` into this channel's lane of `dst`.
    /// Returns bytes consumed from `src`. Encodes from host
    /// representation unless `raw`.
    pub fn write_samples(
        &self,
        mask: &ChannelsMask,
        dst: &mut [u8],
        src: &[u8],
        raw: bool,
    ) -> Result<usize> {
        let (step, offset) = self.geometry(mask)?;
        crate::format::write_samples(&self.data().format, dst, src, offset, step, raw)
    }

    fn geometry(&self, mask: &ChannelsMask) -> Result<(usize, usize)> {
        let number = self.data().number.ok_or(Error::InvalidArg)?;
        if !mask.test_bit(number as usize) {
            return Err(Error::InvalidArg);
        }
        let dev = &self.ctx.devices[self.dev_idx];
        let (step, offset) = scan_geometry(dev, mask, Some(number))?;
        Ok((step, offset.ok_or(Error::InvalidArg)?))
    }
}

// ── Construction helpers ─────────────────────────────────────

fn build_devices(descs: Vec<crate::xml::DeviceDescription>) -> Result<Vec<DeviceData>> {
    if descs.len() > MAX_DEVICES {
        return Err(Error::Protocol);
    }

    descs
        .into_iter()
        .map(|desc| {
            let mut channels: Vec<ChannelData> = desc
                .channels
                .into_iter()
                .map(|chn| {
                    chn.format.validate()?;
                    Ok(ChannelData {
                        id: chn.id,
                        name: chn.name,
                        is_output: chn.is_output,
                        is_scan_element: chn.is_scan_element,
                        index: if chn.is_scan_element { chn.index } else { -1 },
                        number: None,
                        format: chn.format,
                        attrs: chn.attrs,
                    })
                })
                .collect::<Result<_>>()?;

            let scan_count = finalise_channels(&mut channels);
            Ok(DeviceData {
                id: desc.id,
                name: desc.name,
                label: desc.label,
                channels,
                attrs: desc.attrs,
                debug_attrs: desc.debug_attrs,
                buffer_attrs: desc.buffer_attrs,
                scan_count,
                evstream_active: AtomicBool::new(false),
            })
        })
        .collect()
}

/// Sort channels into scan order and assign dense numbers.
///
/// Scan elements first, keyed by `(index, shift)` ascending with
/// `index == -1` last; idempotent. Returns the scan element count.
fn finalise_channels(channels: &mut [ChannelData]) -> usize {
    channels.sort_by_key(|chn| {
        let index = if chn.index < 0 { i64::MAX } else { chn.index };
        (!chn.is_scan_element, index, chn.format.shift)
    });

    let mut number = 0u32;
    for chn in channels.iter_mut() {
        if chn.is_scan_element {
            chn.number = Some(number);
            number += 1;
        } else {
            chn.number = None;
        }
    }
    number as usize
}

/// Walk the scan layout under `mask`: total scan size, and the byte
/// offset of the channel whose number is `target`. Channels align to
/// their own storage width.
fn scan_geometry(
    dev: &DeviceData,
    mask: &ChannelsMask,
    target: Option<u32>,
) -> Result<(usize, Option<usize>)> {
    if mask.nb_words() != ChannelsMask::new(dev.scan_count).nb_words() {
        return Err(Error::InvalidArg);
    }

    let mut size = 0usize;
    let mut offset = None;

    for chn in &dev.channels {
        let Some(number) = chn.number else { continue };
        if !mask.test_bit(number as usize) {
            continue;
        }
        let storage = chn.format.storage_bytes();
        if size % storage != 0 {
            size += storage - size % storage;
        }
        if target == Some(number) {
            offset = Some(size);
        }
        size += chn.format.sample_size();
    }
    Ok((size, offset))
}

fn find_attr(list: &[String], name: &str) -> Result<u16> {
    list.iter()
        .position(|a| a == name)
        .map(|idx| idx as u16)
        .ok_or(Error::NoEntry)
}

fn with_nul(value: &str) -> Vec<u8> {
    let mut data = value.as_bytes().to_vec();
    data.push(0);
    data
}

/// Attribute values are text; trim the C string tail.
fn trim_attr_value(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_str(read: impl FnOnce(&mut [u8]) -> Result<usize>) -> Result<String> {
    let mut buf = [0u8; 1024];
    let n = read(&mut buf)?;
    Ok(trim_attr_value(&buf[..n]))
}

fn backfill_scale_offset(client: &IiodClient, devices: &mut [DeviceData]) {
    for (dev_idx, dev) in devices.iter_mut().enumerate() {
        for (chn_idx, chn) in dev.channels.iter_mut().enumerate() {
            for (attr_name, slot) in [("scale", 0usize), ("offset", 1usize)] {
                let Some(attr_idx) = chn.attrs.iter().position(|a| a == attr_name) else {
                    continue;
                };
                let target = AttrTarget {
                    dev_idx: dev_idx as u8,
                    dev_id: &dev.id,
                    scope: Scope::Channel {
                        chn_idx: chn_idx as u16,
                        output: chn.is_output,
                        chn_id: &chn.id,
                    },
                };
                let mut buf = [0u8; 64];
                let value = client
                    .attr_read(target, attr_idx as u16, attr_name, &mut buf)
                    .and_then(|n| attr::parse_double(&trim_attr_value(&buf[..n])));
                match value {
                    Ok(v) if slot == 0 => chn.format.scale = Some(v),
                    Ok(v) => chn.format.offset = Some(v),
                    Err(err) => {
                        debug!("{}/{}: no usable {attr_name}: {err}", dev.id, chn.id);
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
