//! Detection Relay
//!
//! Runs object detection over a live camera feed and relays the results two
//! ways: annotated frames to live-stream viewers, and detection batches as
//! JSON events to an HTTP collector.
//!
//! # Architecture
//!
//! One producer thread drives the frame loop; the stream server and the
//! event publisher each run on their own threads. The loop never waits on
//! either sink:
//!
//! 1. **Capture**: a `FrameSource` yields frames; failures are retried
//!    briefly and the iteration skipped.
//! 2. **Detect**: the frame is letterboxed, a `DetectorBackend` produces raw
//!    candidates, and post-processing maps them back to frame pixels and
//!    applies NMS.
//! 3. **Distribute**: every frame goes to a `FrameDistributor`, which fans it
//!    out to the attached viewers or drops it when there are none.
//! 4. **Publish**: at most one batch per publish interval goes into the
//!    `EventPublisher`'s drop-oldest queue.
//!
//! # Module Structure
//!
//! - `frame`: owned pixel buffers and format conversion
//! - `detect`: letterbox, backends, post-processing, NMS
//! - `annotate`: box overlays for the live stream
//! - `ingest`: frame sources (synthetic, RTSP, V4L2)
//! - `stream`: viewer registry and MJPEG / RTSP distributors
//! - `publish`: event queue, wire format and HTTP delivery
//! - `pipeline`: the frame loop coordinator
//! - `config`: file and environment configuration
//! - `collector`: loopback HTTP collector for local runs and tests

pub mod annotate;
pub mod collector;
pub mod config;
pub mod detect;
pub mod frame;
mod http;
pub mod ingest;
pub mod labels;
pub mod pipeline;
pub mod publish;
pub mod stream;

pub use collector::{CollectorConfig, CollectorHandle, CollectorServer};
pub use config::{BackendKind, RelayConfig, StreamTransport};
pub use detect::{
    BoundingBox, Detection, DetectionBatch, Detector, DetectorBackend, NmsPolicy,
    PostprocessParams, RawCandidate, StubBackend,
};
pub use frame::{Frame, PixelFormat};
pub use ingest::{CameraConfig, CameraSource, FrameSource, SourceStats};
pub use pipeline::{
    CapturePolicy, Pipeline, PipelineSettings, PipelineState, PipelineStats, PublishGate,
    StepOutcome, StopHandle,
};
pub use publish::{EventPublisher, EventSink, HttpSink, PublisherConfig, PublisherStats};
pub use stream::{DistributorStats, FrameDistributor, MjpegConfig, MjpegDistributor};
#[cfg(feature = "rtsp-gstreamer")]
pub use stream::{RtspConfig, RtspDistributor};
