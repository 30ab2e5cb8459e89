//! XML collaborator seam.
//!
//! The daemon describes its context as an XML document. Parsing that
//! document is not this runtime's job: a [`ContextXmlParser`] is
//! injected at bootstrap and turns the document into the plain data
//! model below, from which the typed object graph is built.

use crate::error::Result;
use crate::format::DataFormat;

/// Converts a context XML document into the plain description model.
pub trait ContextXmlParser {
    fn parse(&self, xml: &str) -> Result<ContextDescription>;
}

/// Everything a context document describes.
#[derive(Debug, Clone, Default)]
pub struct ContextDescription {
    pub description: String,
    /// Context attributes, in document order.
    pub attrs: Vec<(String, String)>,
    pub devices: Vec<DeviceDescription>,
}

/// One device entry.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescription {
    /// Stable short id, e.g. `iio:device3`.
    pub id: String,
    pub name: Option<String>,
    pub label: Option<String>,
    pub channels: Vec<ChannelDescription>,
    /// Attribute names per scope, in document order. The binary
    /// protocol addresses attributes by index into these lists, so the
    /// order must be preserved exactly.
    pub attrs: Vec<String>,
    pub debug_attrs: Vec<String>,
    pub buffer_attrs: Vec<String>,
}

/// One channel entry.
#[derive(Debug, Clone)]
pub struct ChannelDescription {
    pub id: String,
    pub name: Option<String>,
    pub is_output: bool,
    pub is_scan_element: bool,
    /// Logical scan index; -1 when not a scan element.
    pub index: i64,
    pub format: DataFormat,
    pub attrs: Vec<String>,
}

impl Default for ChannelDescription {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: None,
            is_output: false,
            is_scan_element: false,
            index: -1,
            format: DataFormat::default(),
            attrs: Vec::new(),
        }
    }
}
