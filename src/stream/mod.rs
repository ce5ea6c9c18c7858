//! Live-stream distribution of annotated frames.
//!
//! A `FrameDistributor` accepts frames from the pipeline at its native rate
//! and fans them out to every attached viewer:
//! - `MjpegDistributor`: HTTP `multipart/x-mixed-replace` (always built)
//! - `RtspDistributor`: GStreamer RTSP server with one shared H.264 encode
//!   (feature: rtsp-gstreamer)
//!
//! Both keep viewers in a `ViewerRegistry` and stamp frames from a
//! `PtsClock`. `push_frame` never waits on a viewer: with no viewers it is a
//! counted no-op, and a slow viewer only loses frames.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame::{Frame, PixelFormat};

pub mod mjpeg;
pub mod registry;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;

pub use mjpeg::{MjpegConfig, MjpegDistributor};
pub use registry::{Delivery, DeliveryReport, SessionState, ViewerId, ViewerRegistry, ViewerSink};
#[cfg(feature = "rtsp-gstreamer")]
pub use rtsp::{RtspConfig, RtspDistributor};

/// Transport capability set shared by every distributor variant.
pub trait FrameDistributor: Send {
    fn name(&self) -> &'static str;

    /// Acquire transport resources (bind sockets, build the encode pipeline).
    /// A failure here is an initialization fault.
    fn initialize(&mut self) -> Result<()>;

    /// Begin accepting viewers.
    fn start(&mut self) -> Result<()>;

    /// Hand one frame to all attached viewers. Returns `true` when the frame
    /// was accepted, including the zero-viewer case.
    fn push_frame(&mut self, frame: &Frame) -> bool;

    /// Detach all viewers, stop the server loop and release the encoder.
    /// Safe to call more than once.
    fn stop(&mut self) -> Result<()>;

    fn viewer_count(&self) -> usize;

    fn stats(&self) -> DistributorStats;

    /// Where viewers connect, once initialized.
    fn stream_url(&self) -> Option<String>;
}

/// Output stream geometry and rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: PixelFormat,
}

impl OutputFormat {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!(
                "stream resolution must be non-zero ({}x{})",
                self.width,
                self.height
            ));
        }
        if self.fps == 0 {
            return Err(anyhow!("stream fps must be > 0"));
        }
        Ok(())
    }
}

/// Resize to the output resolution, then normalize the pixel format.
pub fn prepare_frame(frame: &Frame, output: &OutputFormat) -> Result<Frame> {
    let resized = if frame.width != output.width || frame.height != output.height {
        frame.resized(output.width, output.height)?
    } else {
        frame.clone()
    };
    resized.to_format(output.pixel_format)
}

/// Presentation timestamps for a constant-rate stream.
///
/// Each tick returns the current PTS and a fixed per-frame duration of
/// `1e9 / fps` nanoseconds; the PTS advances by that duration.
#[derive(Clone, Debug)]
pub struct PtsClock {
    duration_ns: u64,
    next_ns: u64,
}

impl PtsClock {
    pub fn new(fps: u32) -> Result<Self> {
        if fps == 0 {
            return Err(anyhow!("fps must be > 0"));
        }
        Ok(Self {
            duration_ns: 1_000_000_000 / fps as u64,
            next_ns: 0,
        })
    }

    /// `(pts_ns, duration_ns)` for the next frame.
    pub fn tick(&mut self) -> (u64, u64) {
        let pts = self.next_ns;
        self.next_ns = self.next_ns.saturating_add(self.duration_ns);
        (pts, self.duration_ns)
    }

    pub fn frame_duration_ns(&self) -> u64 {
        self.duration_ns
    }

    pub fn reset(&mut self) {
        self.next_ns = 0;
    }
}

/// Point-in-time distributor statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DistributorStats {
    /// Frames offered by the producer.
    pub frames_pushed: u64,
    /// Frames offered while no viewer was attached.
    pub frames_idle: u64,
    /// Per-viewer hand-offs that succeeded.
    pub frames_delivered: u64,
    /// Per-viewer hand-offs refused by backpressure.
    pub frames_dropped: u64,
    pub encode_failures: u64,
    pub viewers: usize,
    pub viewers_total: u64,
    pub clients_connected: u64,
    pub clients_closed: u64,
}

/// Lock-free counters updated from the producer and server threads.
#[derive(Debug, Default)]
pub(crate) struct DistributorCounters {
    pub frames_pushed: AtomicU64,
    pub frames_idle: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub encode_failures: AtomicU64,
    pub viewers_total: AtomicU64,
    pub clients_connected: AtomicU64,
    pub clients_closed: AtomicU64,
}

impl DistributorCounters {
    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record(&self, report: &DeliveryReport) {
        self.frames_delivered
            .fetch_add(report.accepted as u64, Ordering::Relaxed);
        self.frames_dropped
            .fetch_add(report.backpressure as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, viewers: usize) -> DistributorStats {
        DistributorStats {
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_idle: self.frames_idle.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            viewers,
            viewers_total: self.viewers_total.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            clients_closed: self.clients_closed.load(Ordering::Relaxed),
        }
    }
}

/// Log cadence for per-frame debug lines.
pub(crate) fn should_log_frame(frames_pushed: u64, viewers: usize) -> bool {
    let every = if viewers == 0 { 100 } else { 30 };
    frames_pushed % every == 0
}
