use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::letterbox::{InputSpec, InputTensor};
use crate::detect::result::RawCandidate;

const DRIFT_STEPS: u64 = 120;

/// Stub backend for testing and model-less runs.
///
/// Without a script it reports one person drifting left to right across the
/// canvas and one parked car. With a script it replays the given candidate
/// lists in order, wrapping at the end.
pub struct StubBackend {
    spec: InputSpec,
    script: Vec<Vec<RawCandidate>>,
    tick: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            spec: InputSpec::strided(416, 32),
            script: Vec::new(),
            tick: 0,
        }
    }

    /// Replay `script`, one entry per inference call.
    pub fn scripted(script: Vec<Vec<RawCandidate>>) -> Self {
        Self {
            script,
            ..Self::new()
        }
    }

    pub fn with_input_spec(mut self, spec: InputSpec) -> Self {
        self.spec = spec;
        self
    }

    fn drifting(&self) -> Vec<RawCandidate> {
        let phase = (self.tick % DRIFT_STEPS) as f32 / DRIFT_STEPS as f32;
        let left = 0.05 + phase * 0.7;
        vec![
            RawCandidate::new(0, 0.82, left, 0.25, left + 0.2, 0.85),
            RawCandidate::new(2, 0.67, 0.6, 0.55, 0.9, 0.8),
        ]
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn infer(&mut self, input: &InputTensor) -> Result<Vec<RawCandidate>> {
        let expected = (input.width as usize) * (input.height as usize) * 3;
        if input.data.len() != expected {
            return Err(anyhow!(
                "tensor holds {} values, expected {} for {}x{}",
                input.data.len(),
                expected,
                input.width,
                input.height
            ));
        }
        let candidates = if self.script.is_empty() {
            self.drifting()
        } else {
            let idx = (self.tick % self.script.len() as u64) as usize;
            self.script[idx].clone()
        };
        self.tick = self.tick.wrapping_add(1);
        Ok(candidates)
    }
}
