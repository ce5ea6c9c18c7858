mod backend;
pub mod backends;
pub mod letterbox;
pub mod postprocess;
mod result;

use anyhow::{Context, Result};

use crate::frame::Frame;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use letterbox::{InputSpec, InputTensor, Letterbox};
pub use postprocess::{non_max_suppression, postprocess, postprocess_padded, NmsPolicy, PostprocessParams};
pub use result::{BoundingBox, Detection, DetectionBatch, RawCandidate};

/// Frame-in, detections-out wrapper around a backend.
pub struct Detector {
    backend: Box<dyn DetectorBackend>,
    params: PostprocessParams,
}

impl Detector {
    pub fn new(backend: Box<dyn DetectorBackend>, params: PostprocessParams) -> Self {
        Self { backend, params }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn params(&self) -> &PostprocessParams {
        &self.params
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.backend
            .warm_up()
            .with_context(|| format!("{} backend warm-up failed", self.backend.name()))
    }

    /// Letterbox `frame`, run inference and post-process the result.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let letterbox = Letterbox::new(frame.width, frame.height, self.backend.input_spec())?;
        let input = letterbox::build_input(frame, &letterbox)?;
        let candidates = self.backend.infer(&input)?;
        Ok(postprocess(&candidates, &letterbox, &self.params))
    }
}
