#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::letterbox::{InputSpec, InputTensor};
use crate::detect::result::RawCandidate;

/// Values per candidate row: class, confidence, x1, y1, x2, y2.
const ROW_LEN: usize = 6;

/// Tract-based backend for ONNX detection models.
///
/// The model takes a `1x3xSxS` RGB tensor and emits `N x 6` rows of
/// `[class, confidence, x1, y1, x2, y2]` normalized to the input canvas.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_size })
    }

    fn to_tensor(&self, input: &InputTensor) -> Result<Tensor> {
        if input.width != self.input_size || input.height != self.input_size {
            return Err(anyhow!(
                "input tensor {}x{} does not match model input {}x{}",
                input.width,
                input.height,
                self.input_size,
                self.input_size
            ));
        }
        let side = self.input_size as usize;
        tract_ndarray::Array4::from_shape_vec((1, 3, side, side), input.data.clone())
            .map(|array| array.into_tensor())
            .context("input tensor has the wrong number of values")
    }

    fn extract_candidates(&self, outputs: TVec<TValue>) -> Result<Vec<RawCandidate>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let rows = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let flat: Vec<f32> = rows.iter().copied().collect();
        if flat.len() % ROW_LEN != 0 {
            return Err(anyhow!(
                "model output length {} is not a multiple of {}",
                flat.len(),
                ROW_LEN
            ));
        }
        Ok(flat
            .chunks_exact(ROW_LEN)
            .map(|row| RawCandidate::new(row[0] as i32, row[1], row[2], row[3], row[4], row[5]))
            .collect())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_spec(&self) -> InputSpec {
        InputSpec::square(self.input_size)
    }

    fn infer(&mut self, input: &InputTensor) -> Result<Vec<RawCandidate>> {
        let tensor = self.to_tensor(input)?;
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        self.extract_candidates(outputs)
    }
}
