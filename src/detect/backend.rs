use anyhow::Result;

use crate::detect::letterbox::{InputSpec, InputTensor};
use crate::detect::result::RawCandidate;

/// Inference engine seam.
///
/// A backend receives the letterboxed tensor built from `input_spec()` and
/// returns raw candidate rows normalized to that tensor. Filtering, coordinate
/// inversion and suppression happen in the postprocessor, never here.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Input geometry the engine expects.
    fn input_spec(&self) -> InputSpec;

    /// Run inference on one prepared tensor.
    fn infer(&mut self, input: &InputTensor) -> Result<Vec<RawCandidate>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
