use log::{debug, info, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, UNIX_EPOCH};

use crate::analysis::{HeaderParser, ParseOutcome, SkipReason};
use crate::broadcast::BroadcastHub;
use crate::capture::frame::{CaptureError, FrameSource};
use crate::utils::formatting::{format_bytes, format_count};

/// Counters written by the capture thread and read by anyone else.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_captured: AtomicU64,
    bytes_captured: AtomicU64,
    records_published: AtomicU64,
    skipped_not_ip: AtomicU64,
    skipped_malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub frames_captured: u64,
    pub bytes_captured: u64,
    pub records_published: u64,
    pub skipped_not_ip: u64,
    pub skipped_malformed: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            bytes_captured: self.bytes_captured.load(Ordering::Relaxed),
            records_published: self.records_published.load(Ordering::Relaxed),
            skipped_not_ip: self.skipped_not_ip.load(Ordering::Relaxed),
            skipped_malformed: self.skipped_malformed.load(Ordering::Relaxed),
        }
    }
}

impl CaptureSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "{} frames ({}), {} published, {} non-IP, {} malformed",
            format_count(self.frames_captured),
            format_bytes(self.bytes_captured),
            format_count(self.records_published),
            format_count(self.skipped_not_ip),
            format_count(self.skipped_malformed),
        )
    }
}

// Closes the source on every exit path out of the loop, errors included.
struct CloseOnDrop<S: FrameSource>(S);

impl<S: FrameSource> Drop for CloseOnDrop<S> {
    fn drop(&mut self) {
        if !self.0.is_closed() {
            self.0.close();
            debug!("Released capture handle on {}", self.0.interface());
        }
    }
}

/// Pulls frames until `stop` is set or the source fails, classifying each one
/// inline and publishing records to the hub. The source is closed on return.
pub fn run_capture_loop<S: FrameSource>(
    source: S,
    hub: &BroadcastHub,
    stats: &CaptureStats,
    stop: &AtomicBool,
    report_every: Option<Duration>,
) -> Result<(), CaptureError> {
    let mut source = CloseOnDrop(source);
    let parser = HeaderParser::new(source.0.link_type());
    let interface = source.0.interface().to_string();
    let mut last_report = Instant::now();

    info!("Capture loop started on {}", interface);

    while !stop.load(Ordering::Acquire) {
        if let Some(frame) = source.0.next_frame()? {
            stats.frames_captured.fetch_add(1, Ordering::Relaxed);
            stats.bytes_captured.fetch_add(frame.len() as u64, Ordering::Relaxed);

            let captured_at = frame.timestamp();
            match parser.parse(frame) {
                ParseOutcome::Record(record) => {
                    trace!(
                        "[Packet] {} at {:.6}",
                        record,
                        captured_at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
                    );
                    hub.publish(record);
                    stats.records_published.fetch_add(1, Ordering::Relaxed);
                },
                ParseOutcome::Skip(SkipReason::NotIp) => {
                    stats.skipped_not_ip.fetch_add(1, Ordering::Relaxed);
                },
                ParseOutcome::Skip(SkipReason::Malformed) => {
                    stats.skipped_malformed.fetch_add(1, Ordering::Relaxed);
                },
            }
        }

        if let Some(interval) = report_every {
            if last_report.elapsed() >= interval {
                info!("[{}] {}, {} viewers", interface, stats.snapshot().summary(), hub.subscriber_count());
                last_report = Instant::now();
            }
        }
    }

    info!("Capture loop stopped on {}", interface);
    Ok(())
}
