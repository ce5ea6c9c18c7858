//! Frame ingestion sources.
//!
//! Every source implements `FrameSource`, the seam the pipeline captures
//! through. `CameraSource` covers synthetic, RTSP and V4L2 inputs.

use anyhow::Result;

use crate::frame::Frame;

pub mod camera;

pub use camera::{CameraConfig, CameraSource};

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

pub trait FrameSource: Send {
    /// Open (or reopen) the underlying stream.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame. May block up to roughly one frame period.
    fn next_frame(&mut self) -> Result<Frame>;

    /// False once the stream has errored or stalled; the caller reconnects.
    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}
