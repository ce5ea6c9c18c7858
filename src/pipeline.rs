//! Frame loop coordinator.
//!
//! Capture, detect, annotate, push every frame to the distributor and hand a
//! detection batch to the publisher at most once per publish interval. The
//! coordinator owns the timing gate and the run statistics; the distributor
//! and publisher run their own threads and never block the loop.

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::annotate::draw_detections;
use crate::config::{BackendKind, RelayConfig, StreamTransport};
use crate::detect::{DetectionBatch, Detector, DetectorBackend, InputSpec, StubBackend};
use crate::frame::Frame;
use crate::ingest::{CameraSource, FrameSource};
use crate::publish::{EventPublisher, HttpSink, PublisherStats};
use crate::stream::{DistributorStats, FrameDistributor, MjpegDistributor};

const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Ready,
    Running,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

/// How frame acquisition failures are absorbed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturePolicy {
    /// Capture attempts per iteration.
    pub retries: u32,
    /// Pause after each failed attempt.
    pub backoff: Duration,
    /// Pause before the next iteration once all attempts failed.
    pub skip_backoff: Duration,
    /// Skipped iterations in a row that stop the pipeline; 0 never stops.
    pub max_consecutive_failures: u32,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(10),
            skip_backoff: Duration::from_millis(100),
            max_consecutive_failures: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Source identifier stamped on every batch.
    pub camera_id: String,
    pub publish_interval: Duration,
    pub annotate: bool,
    pub capture: CapturePolicy,
    pub stats_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            camera_id: "camera_0".to_string(),
            publish_interval: Duration::from_millis(100),
            annotate: true,
            capture: CapturePolicy::default(),
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// Cloneable stop request, checked at every iteration boundary.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall-clock gate between forwarded batches.
///
/// The first call opens the gate; afterwards it opens once `interval` has
/// elapsed since the last time it did.
#[derive(Clone, Debug)]
pub struct PublishGate {
    interval: Duration,
    last: Option<Instant>,
}

impl PublishGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_publish(&mut self, now: Instant) -> bool {
        let open = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if open {
            self.last = Some(now);
        }
        open
    }
}

/// Result of one loop iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Processed { detections: usize, forwarded: bool },
    /// Capture failed after every attempt; nothing was pushed.
    Skipped,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub runtime: Duration,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub detections_total: u64,
    pub detect_failures: u64,
    pub batches_forwarded: u64,
    pub publisher: PublisherStats,
    pub stream: DistributorStats,
}

impl PipelineStats {
    pub fn average_fps(&self) -> f64 {
        per_second(self.frames_processed, self.runtime)
    }

    pub fn detections_per_second(&self) -> f64 {
        per_second(self.detections_total, self.runtime)
    }
}

fn per_second(count: u64, runtime: Duration) -> f64 {
    let secs = runtime.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

#[derive(Debug, Default)]
struct LoopCounters {
    frames_processed: u64,
    frames_skipped: u64,
    detections_total: u64,
    detect_failures: u64,
    batches_forwarded: u64,
}

pub struct Pipeline {
    state: PipelineState,
    source: Box<dyn FrameSource>,
    detector: Detector,
    distributor: Box<dyn FrameDistributor>,
    publisher: EventPublisher,
    settings: PipelineSettings,
    gate: PublishGate,
    stop: StopHandle,
    counters: LoopCounters,
    consecutive_skips: u32,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Detector,
        distributor: Box<dyn FrameDistributor>,
        publisher: EventPublisher,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            state: PipelineState::Uninitialized,
            source,
            detector,
            distributor,
            publisher,
            gate: PublishGate::new(settings.publish_interval),
            settings,
            stop: StopHandle::default(),
            counters: LoopCounters::default(),
            consecutive_skips: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Assemble every component described by `cfg`. Nothing is connected or
    /// bound until `initialize`.
    pub fn from_config(cfg: &RelayConfig) -> Result<Self> {
        let source = CameraSource::new(cfg.camera_config())
            .with_context(|| format!("camera source {}", cfg.camera.url))?;
        let detector = Detector::new(build_backend(cfg)?, cfg.postprocess_params());
        let distributor = build_distributor(cfg)?;
        let sink = HttpSink::new(
            &cfg.publisher.host,
            cfg.publisher.port,
            &cfg.publisher.endpoint,
            cfg.publisher.timeout,
        )?;
        let publisher = EventPublisher::new(Box::new(sink), cfg.publisher_config())?;
        let settings = PipelineSettings {
            camera_id: cfg.camera.camera_id.clone(),
            publish_interval: cfg.publisher.publish_interval,
            annotate: cfg.detection.draw_detections,
            capture: cfg.pipeline.clone(),
            stats_interval: DEFAULT_STATS_INTERVAL,
        };
        Ok(Self::new(
            Box::new(source),
            detector,
            distributor,
            publisher,
            settings,
        ))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stream_url(&self) -> Option<String> {
        self.distributor.stream_url()
    }

    /// Bring every component up. Any failure is an initialization fault:
    /// the pipeline stays `Uninitialized` and never runs.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != PipelineState::Uninitialized {
            bail!("pipeline cannot initialize from state {}", self.state);
        }
        if let Err(err) = self.bring_up() {
            if let Err(stop_err) = self.distributor.stop() {
                log::warn!("pipeline: releasing distributor failed: {:#}", stop_err);
            }
            return Err(err.context("pipeline initialization failed"));
        }
        self.state = PipelineState::Ready;
        log::info!(
            "pipeline: ready (detector={}, stream={}{})",
            self.detector.backend_name(),
            self.distributor.name(),
            self.distributor
                .stream_url()
                .map(|url| format!(" at {}", url))
                .unwrap_or_default()
        );
        Ok(())
    }

    fn bring_up(&mut self) -> Result<()> {
        self.source.connect().context("frame source connect")?;
        self.detector.warm_up()?;
        self.distributor
            .initialize()
            .with_context(|| format!("{} distributor initialize", self.distributor.name()))?;
        self.distributor
            .start()
            .with_context(|| format!("{} distributor start", self.distributor.name()))?;
        self.publisher.start().context("event publisher start")?;
        Ok(())
    }

    /// Drive the frame loop until a stop is requested or the source fails
    /// for good, then tear down. Returns the final statistics.
    pub fn run(&mut self) -> Result<PipelineStats> {
        if self.state != PipelineState::Ready {
            bail!("pipeline cannot run from state {}", self.state);
        }
        self.state = PipelineState::Running;
        self.started_at = Some(Instant::now());
        log::info!("pipeline: running (publish interval {:?})", self.settings.publish_interval);

        let mut last_stats_log = Instant::now();
        let mut fault = None;
        while !self.stop.is_stop_requested() {
            if let Err(err) = self.step() {
                log::error!("pipeline: {:#}", err);
                fault = Some(err);
                break;
            }
            if last_stats_log.elapsed() >= self.settings.stats_interval {
                self.log_stats();
                last_stats_log = Instant::now();
            }
        }

        self.stop()?;
        let stats = self.stats();
        log_summary(&stats);
        match fault {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    /// One iteration of the frame loop. Errors only for an unrecoverable
    /// source fault.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let Some(mut frame) = self.capture_with_retry() else {
            self.counters.frames_skipped += 1;
            self.consecutive_skips += 1;
            let limit = self.settings.capture.max_consecutive_failures;
            if limit > 0 && self.consecutive_skips >= limit {
                return Err(anyhow!(
                    "frame capture failed {} iterations in a row",
                    self.consecutive_skips
                ));
            }
            log::warn!("pipeline: failed to capture frame after retries");
            if !self.source.is_healthy() {
                self.reconnect();
            }
            thread::sleep(self.settings.capture.skip_backoff);
            return Ok(StepOutcome::Skipped);
        };
        self.consecutive_skips = 0;
        self.counters.frames_processed += 1;

        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                self.counters.detect_failures += 1;
                log::warn!("pipeline: detection failed on frame {}: {:#}", frame.sequence, err);
                Vec::new()
            }
        };
        let count = detections.len();
        self.counters.detections_total += count as u64;

        if self.settings.annotate && !detections.is_empty() {
            draw_detections(&mut frame, &detections);
        }
        self.distributor.push_frame(&frame);

        let mut forwarded = false;
        if self.gate.should_publish(Instant::now()) {
            let batch = DetectionBatch::new(
                detections,
                frame.captured_at,
                frame.width,
                frame.height,
                self.settings.camera_id.clone(),
            );
            forwarded = self.publisher.enqueue(batch);
            if forwarded {
                self.counters.batches_forwarded += 1;
            }
        }

        if !self.source.is_healthy() {
            self.reconnect();
        }
        Ok(StepOutcome::Processed {
            detections: count,
            forwarded,
        })
    }

    fn capture_with_retry(&mut self) -> Option<Frame> {
        let attempts = self.settings.capture.retries.max(1);
        for attempt in 1..=attempts {
            match self.source.next_frame() {
                Ok(frame) => return Some(frame),
                Err(err) => {
                    log::debug!("pipeline: capture attempt {}/{} failed: {:#}", attempt, attempts, err);
                    thread::sleep(self.settings.capture.backoff);
                }
            }
        }
        None
    }

    fn reconnect(&mut self) {
        let url = self.source.stats().url;
        match self.source.connect() {
            Ok(()) => log::info!("pipeline: reconnected to {}", url),
            Err(err) => log::warn!("pipeline: reconnect to {} failed: {:#}", url, err),
        }
    }

    /// Tear down the distributor, then the publisher. Terminal.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == PipelineState::Stopped {
            return Ok(());
        }
        self.stop.request_stop();
        let distributor = self.distributor.stop();
        let publisher = self.publisher.stop();
        self.finished_at = Some(Instant::now());
        self.state = PipelineState::Stopped;
        log::info!("pipeline: stopped");
        distributor.context("stop distributor")?;
        publisher.context("stop event publisher")
    }

    pub fn stats(&self) -> PipelineStats {
        let runtime = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        PipelineStats {
            runtime,
            frames_processed: self.counters.frames_processed,
            frames_skipped: self.counters.frames_skipped,
            detections_total: self.counters.detections_total,
            detect_failures: self.counters.detect_failures,
            batches_forwarded: self.counters.batches_forwarded,
            publisher: self.publisher.stats(),
            stream: self.distributor.stats(),
        }
    }

    fn log_stats(&self) {
        let stats = self.stats();
        let source = self.source.stats();
        log::info!(
            "health: source={} healthy={} captured={} | frames={} fps={:.1} detections={} | queue={} published={} failed={} | viewers={} delivered={} dropped={}",
            source.url,
            self.source.is_healthy(),
            source.frames_captured,
            stats.frames_processed,
            stats.average_fps(),
            stats.detections_total,
            stats.publisher.queue_depth,
            stats.publisher.published,
            stats.publisher.failed,
            stats.stream.viewers,
            stats.stream.frames_delivered,
            stats.stream.frames_dropped
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("pipeline: stop during drop failed: {:#}", err);
        }
    }
}

fn log_summary(stats: &PipelineStats) {
    log::info!("=== Final Statistics ===");
    log::info!("runtime: {:.1}s", stats.runtime.as_secs_f64());
    log::info!(
        "frames processed: {} (skipped {})",
        stats.frames_processed,
        stats.frames_skipped
    );
    log::info!("total detections: {}", stats.detections_total);
    log::info!("average FPS: {:.2}", stats.average_fps());
    log::info!("detections/sec: {:.2}", stats.detections_per_second());
    log::info!(
        "events: forwarded {} published {} failed {} evicted {} queued {}",
        stats.batches_forwarded,
        stats.publisher.published,
        stats.publisher.failed,
        stats.publisher.evicted,
        stats.publisher.queue_depth
    );
    log::info!(
        "stream: viewers {} delivered {} dropped {}",
        stats.stream.viewers_total,
        stats.stream.frames_delivered,
        stats.stream.frames_dropped
    );
}

fn build_backend(cfg: &RelayConfig) -> Result<Box<dyn DetectorBackend>> {
    match cfg.detection.backend {
        BackendKind::Stub => Ok(Box::new(
            StubBackend::new().with_input_spec(InputSpec::strided(cfg.detection.input_size, 32)),
        )),
        #[cfg(feature = "backend-tract")]
        BackendKind::Tract => Ok(Box::new(crate::detect::TractBackend::new(
            &cfg.detection.model_path,
            cfg.detection.input_size,
        )?)),
        #[cfg(not(feature = "backend-tract"))]
        BackendKind::Tract => bail!("tract backend requires the backend-tract feature"),
    }
}

fn build_distributor(cfg: &RelayConfig) -> Result<Box<dyn FrameDistributor>> {
    match cfg.stream.transport {
        StreamTransport::Mjpeg => Ok(Box::new(MjpegDistributor::new(cfg.mjpeg_config())?)),
        #[cfg(feature = "rtsp-gstreamer")]
        StreamTransport::Rtsp => Ok(Box::new(crate::stream::RtspDistributor::new(
            cfg.rtsp_config(),
        )?)),
        #[cfg(not(feature = "rtsp-gstreamer"))]
        StreamTransport::Rtsp => bail!("rtsp transport requires the rtsp-gstreamer feature"),
    }
}
