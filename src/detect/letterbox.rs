//! Letterbox geometry and input tensor construction.
//!
//! The detector sees the frame scaled by `s = target / max(w, h)`, with the
//! short side padded symmetrically (pad value 114) up to either the stride
//! multiple or the full square. Candidates come back normalized to that padded
//! canvas; `Letterbox::to_original` undoes both the scale and the padding.

use anyhow::{anyhow, Result};

use crate::frame::{Frame, PixelFormat};

/// Grey used for padding, as in the usual YOLO preprocessing.
pub const PAD_VALUE: u8 = 114;

/// What the inference engine expects as input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputSpec {
    /// Length of the long side after scaling.
    pub target_size: u32,
    /// Pad each side up to a multiple of this; `None` pads to a full square.
    pub stride: Option<u32>,
}

impl InputSpec {
    pub fn square(target_size: u32) -> Self {
        Self {
            target_size,
            stride: None,
        }
    }

    pub fn strided(target_size: u32, stride: u32) -> Self {
        Self {
            target_size,
            stride: Some(stride),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub original_width: u32,
    pub original_height: u32,
    pub scale: f32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub padded_width: u32,
    pub padded_height: u32,
    pub pad_left: u32,
    pub pad_top: u32,
}

impl Letterbox {
    /// Geometry for a `width`x`height` frame fed to a detector with `spec`.
    pub fn new(width: u32, height: u32, spec: InputSpec) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot letterbox a {}x{} frame", width, height));
        }
        if spec.target_size == 0 {
            return Err(anyhow!("detector target size must be non-zero"));
        }
        let scale = spec.target_size as f32 / width.max(height) as f32;
        let resized_width = ((width as f32 * scale) as u32).clamp(1, spec.target_size);
        let resized_height = ((height as f32 * scale) as u32).clamp(1, spec.target_size);
        let (padded_width, padded_height) = match spec.stride {
            Some(stride) if stride > 1 => (
                round_up(resized_width, stride),
                round_up(resized_height, stride),
            ),
            Some(_) => (resized_width, resized_height),
            None => (spec.target_size, spec.target_size),
        };
        Ok(Self {
            original_width: width,
            original_height: height,
            scale,
            resized_width,
            resized_height,
            padded_width,
            padded_height,
            pad_left: (padded_width - resized_width) / 2,
            pad_top: (padded_height - resized_height) / 2,
        })
    }

    /// Recover the geometry from the padded canvas size alone.
    pub fn from_padded(
        width: u32,
        height: u32,
        padded_width: u32,
        padded_height: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 || padded_width == 0 || padded_height == 0 {
            return Err(anyhow!(
                "invalid letterbox {}x{} -> {}x{}",
                width,
                height,
                padded_width,
                padded_height
            ));
        }
        let scale = (padded_width as f32 / width as f32).min(padded_height as f32 / height as f32);
        let resized_width = ((width as f32 * scale).round() as u32).clamp(1, padded_width);
        let resized_height = ((height as f32 * scale).round() as u32).clamp(1, padded_height);
        Ok(Self {
            original_width: width,
            original_height: height,
            scale,
            resized_width,
            resized_height,
            padded_width,
            padded_height,
            pad_left: (padded_width - resized_width) / 2,
            pad_top: (padded_height - resized_height) / 2,
        })
    }

    /// Map a point normalized to the padded canvas back to original pixels.
    /// The result is not clamped.
    pub fn to_original(&self, nx: f32, ny: f32) -> (f32, f32) {
        let px = nx * self.padded_width as f32;
        let py = ny * self.padded_height as f32;
        (
            (px - self.pad_left as f32) / self.scale,
            (py - self.pad_top as f32) / self.scale,
        )
    }
}

fn round_up(value: u32, stride: u32) -> u32 {
    value.div_ceil(stride) * stride
}

/// Planar RGB tensor (1 x 3 x H x W), values in [0, 1].
#[derive(Clone, Debug)]
pub struct InputTensor {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

/// Scale, pad and normalize `frame` according to `letterbox`.
pub fn build_input(frame: &Frame, letterbox: &Letterbox) -> Result<InputTensor> {
    let rgb = frame
        .to_format(PixelFormat::Rgb24)?
        .resized(letterbox.resized_width, letterbox.resized_height)?;

    let width = letterbox.padded_width as usize;
    let height = letterbox.padded_height as usize;
    let plane = width * height;
    let pad = PAD_VALUE as f32 / 255.0;
    let mut data = vec![pad; plane * 3];

    let src = rgb.pixels();
    let src_w = letterbox.resized_width as usize;
    let left = letterbox.pad_left as usize;
    let top = letterbox.pad_top as usize;
    for y in 0..letterbox.resized_height as usize {
        for x in 0..src_w {
            let s = (y * src_w + x) * 3;
            let d = (y + top) * width + (x + left);
            for channel in 0..3 {
                data[channel * plane + d] = src[s + channel] as f32 / 255.0;
            }
        }
    }

    Ok(InputTensor {
        data,
        width: letterbox.padded_width,
        height: letterbox.padded_height,
    })
}
