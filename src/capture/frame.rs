use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture unavailable on interface '{interface}': {reason}. Try: sudo setcap cap_net_raw,cap_net_admin=eip ./packet-lens")]
    Unavailable { interface: String, reason: String },

    #[error("Network interface '{0}' not found. Available interfaces: {1:?}")]
    InterfaceNotFound(String, Vec<String>),

    #[error("Capture terminated: {0}")]
    Terminated(String),
}

/// Link-layer framing of every frame read from one capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Linux cooked capture, produced by the `any` pseudo-interface.
    LinuxSll,
    RawIp,
}

/// One captured link-layer frame. Owned by whichever pipeline stage holds it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: Vec<u8>,
    length: usize,
    timestamp: SystemTime,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, timestamp: SystemTime) -> Self {
        let length = data.len();
        Self { data, length, timestamp }
    }

    /// Frame whose on-the-wire length exceeds the captured bytes (snaplen truncation).
    pub fn with_wire_length(data: Vec<u8>, wire_length: usize, timestamp: SystemTime) -> Self {
        let length = wire_length.max(data.len());
        Self { data, length, timestamp }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// A blocking producer of raw frames from one interface.
///
/// `next_frame` blocks until a frame arrives or the read timeout elapses, in which
/// case it returns `Ok(None)` so the caller can check for cancellation.
pub trait FrameSource: Send {
    fn interface(&self) -> &str;

    fn link_type(&self) -> LinkType;

    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError>;

    /// Releases the capture handle. Calling it more than once is a no-op.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
