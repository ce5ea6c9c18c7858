//! Camera frame source.
//!
//! `CameraSource` dispatches on the URL scheme:
//! - `stub://...` produces synthetic BGR frames paced at the configured fps
//! - `rtsp://...` decodes an IP camera stream via GStreamer
//! - `v4l2:///dev/videoN` reads a local capture device via GStreamer
//!
//! The GStreamer backends require the `rtsp-gstreamer` feature.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};

use crate::frame::{Frame, PixelFormat};
use crate::ingest::{FrameSource, SourceStats};

/// Configuration for a camera source.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Source URL (e.g., "rtsp://192.168.1.100:554/stream" or "stub://camera_0").
    pub url: String,
    /// Target frame rate. Synthetic sources pace themselves to it; 0 disables pacing.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera_0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

pub struct CameraSource {
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            anyhow::bail!(
                "camera resolution must be non-zero ({}x{})",
                config.width,
                config.height
            );
        }
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: CameraBackend::Synthetic(SyntheticSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: CameraBackend::Gstreamer(GstreamerSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!(
                    "camera url '{}' requires the rtsp-gstreamer feature",
                    config.url
                )
            }
        }
    }
}

impl FrameSource for CameraSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            CameraBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            CameraBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "rtsp-gstreamer")]
            CameraBackend::Gstreamer(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            CameraBackend::Gstreamer(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticSource {
    config: CameraConfig,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            next_due: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.next_due = None;
        log::info!("CameraSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.pace();
        let pixels = self.generate_pixels();
        let frame = Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            PixelFormat::Bgr24,
        )?
        .with_sequence(self.frame_count);
        self.frame_count += 1;
        Ok(frame)
    }

    /// Sleep until the next frame slot so the loop runs at camera rate.
    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let period = Duration::from_secs(1) / self.config.target_fps;
        let now = Instant::now();
        match self.next_due {
            Some(due) if due > now => {
                std::thread::sleep(due - now);
                self.next_due = Some(due + period);
            }
            _ => self.next_due = Some(now + period),
        }
    }

    /// Dark gradient background with a bright bar sweeping left to right.
    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let bar_width = (width / 8).max(1);
        let bar_left = (self.frame_count as usize * 4) % width;
        let mut pixels = vec![0u8; width * height * 3];
        for (y, row) in pixels.chunks_exact_mut(width * 3).enumerate() {
            let shade = (y * 96 / height) as u8;
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let in_bar = (x + width - bar_left) % width < bar_width;
                if in_bar {
                    px.copy_from_slice(&[220, 220, 220]);
                } else {
                    px.copy_from_slice(&[shade, shade / 2, 32]);
                }
            }
        }
        pixels
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// GStreamer capture (rtsp://, v4l2://)
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSource {
    config: CameraConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSource {
    fn new(config: CameraConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "{} ! videoconvert ! videoscale ! video/x-raw,format=BGR,width={},height={} ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            source_element(&config.url),
            config.width,
            config.height
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", PixelFormat::Bgr24.caps_name())
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    /// Start (or restart) the pipeline. Clears any recorded stream error.
    fn connect(&mut self) -> Result<()> {
        if self.connected_at.is_some() {
            self.pipeline
                .set_state(gstreamer::State::Null)
                .context("reset capture pipeline")?;
        }
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;
        self.connected_at = Some(Instant::now());
        self.last_frame_at = None;
        self.last_error = None;
        log::info!("CameraSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.poll_bus();

        let timeout = self.frame_timeout();
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .context("pull camera sample")?
            .ok_or_else(|| anyhow::anyhow!("camera stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        let frame = Frame::new(pixels, width, height, PixelFormat::Bgr24)?
            .with_sequence(self.frame_count);

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    let error = format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    );
                    log::warn!("CameraSource: {}", error);
                    self.last_error = Some(error);
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn source_element(url: &str) -> String {
    if let Some(device) = url.strip_prefix("v4l2://") {
        format!("v4l2src device={}", device)
    } else if url.starts_with("rtsp://") {
        format!("rtspsrc location={} latency=0 ! decodebin", url)
    } else {
        format!("uridecodebin uri={}", url)
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("camera sample missing buffer")?;
    let caps = sample.caps().context("camera sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse camera caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map camera buffer")?;
    let pixels = pack_rows(map.as_slice(), stride, row_bytes, height as usize)?;
    Ok((pixels, width, height))
}

/// Copy `rows` rows of `row_bytes` each out of a buffer laid out with
/// `stride` bytes per row, dropping any row padding.
#[cfg_attr(not(feature = "rtsp-gstreamer"), allow(dead_code))]
fn pack_rows(data: &[u8], stride: usize, row_bytes: usize, rows: usize) -> Result<Vec<u8>> {
    if stride == row_bytes {
        return Ok(data
            .get(..row_bytes * rows)
            .context("camera buffer shorter than frame")?
            .to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("camera buffer row is out of bounds")?,
        );
    }
    Ok(pixels)
}
