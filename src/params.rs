//! Context construction parameters.
//!
//! All tunables a caller can set before connecting. There is no
//! process-wide state; every context stores its own copy.

/// Parameters applied when a context is created.
#[derive(Debug, Clone)]
pub struct ContextParams {
    // --- Wire ---
    /// Default I/O timeout in milliseconds. 0 means "never time out".
    pub timeout_ms: u32,
    /// Probe for the binary protocol at connect time. When the probe is
    /// rejected the session stays on the legacy text protocol.
    pub probe_binary: bool,

    // --- Serial defaults (overridable per URI) ---
    /// Baud rate used when the URI omits one.
    pub serial_baud: u32,

    // --- Bootstrap ---
    /// Read `scale`/`offset` channel attributes after construction and
    /// cache them in each channel's data format.
    pub backfill_scale_offset: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            probe_binary: true,
            serial_baud: 115_200,
            backfill_scale_offset: true,
        }
    }
}
