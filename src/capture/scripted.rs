//! In-memory frame source used by tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::capture::frame::{CaptureError, FrameSource, LinkType, RawFrame};

pub struct ScriptedSource {
    frames: VecDeque<RawFrame>,
    fail_when_empty: bool,
    closed: Arc<AtomicBool>,
    close_calls: Arc<AtomicUsize>,
}

impl ScriptedSource {
    /// Replays `frames`, then reports the capture as terminated.
    pub fn failing_after(frames: Vec<RawFrame>) -> Self {
        Self { frames: frames.into(), fail_when_empty: true, ..Self::empty() }
    }

    /// Replays `frames`, then behaves like an idle interface.
    pub fn idle_after(frames: Vec<RawFrame>) -> Self {
        Self { frames: frames.into(), fail_when_empty: false, ..Self::empty() }
    }

    fn empty() -> Self {
        Self {
            frames: VecDeque::new(),
            fail_when_empty: false,
            closed: Arc::new(AtomicBool::new(false)),
            close_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn close_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.close_calls)
    }
}

impl FrameSource for ScriptedSource {
    fn interface(&self) -> &str {
        "scripted0"
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::Terminated("handle closed".to_string()));
        }
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if self.fail_when_empty => Err(CaptureError::Terminated("script exhausted".to_string())),
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(None)
            },
        }
    }

    fn close(&mut self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn ethernet(ethertype: u16, payload: &[u8], len: usize) -> RawFrame {
    let mut data = vec![0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    data.extend_from_slice(&ethertype.to_be_bytes());
    data.extend_from_slice(payload);
    if data.len() < len {
        data.resize(len, 0);
    }
    RawFrame::new(data, SystemTime::now())
}

fn ipv4_header(protocol: u8) -> [u8; 20] {
    let mut header = [0u8; 20];
    header[0] = 0x45;
    header[8] = 64;
    header[9] = protocol;
    header[12..16].copy_from_slice(&[172, 16, 0, 1]);
    header[16..20].copy_from_slice(&[172, 16, 0, 2]);
    header
}

pub fn ipv4_frame(protocol: u8, len: usize) -> RawFrame {
    ethernet(0x0800, &ipv4_header(protocol), len)
}

pub fn arp_frame() -> RawFrame {
    ethernet(0x0806, &[0u8; 28], 42)
}

pub fn truncated_ipv4_frame() -> RawFrame {
    ethernet(0x0800, &ipv4_header(6)[..16], 30)
}
