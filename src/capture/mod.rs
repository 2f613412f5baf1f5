pub mod frame;
pub mod pcap_engine;
pub mod pipeline;
#[cfg(test)]
pub mod scripted;

pub use frame::{CaptureError, FrameSource, LinkType, RawFrame};
pub use pcap_engine::PcapEngine;
pub use pipeline::{run_capture_loop, CaptureSnapshot, CaptureStats};
