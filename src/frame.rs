//! Video frame container shared by ingest, detection, annotation and streaming.
//!
//! - `Frame`: owned pixel buffer plus dimensions, pixel format, capture time
//!   and a per-source sequence number.
//! - `PixelFormat`: the packed 8-bit layouts produced by the sources.
//!
//! Frames are validated on construction: the buffer length always matches
//! `width * height * bytes_per_pixel`, so downstream code can index without
//! re-checking.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel, Rgb, Rgba};

/// Packed pixel layouts understood by the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr24,
    Rgb24,
    Bgra32,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 3,
            PixelFormat::Bgra32 => 4,
            PixelFormat::Gray8 => 1,
        }
    }

    /// GStreamer caps format name.
    pub fn caps_name(self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "BGR",
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Bgra32 => "BGRA",
            PixelFormat::Gray8 => "GRAY8",
        }
    }
}

/// One decoded video frame.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub captured_at: DateTime<Utc>,
    pub sequence: u64,
}

impl Frame {
    /// Wrap a pixel buffer. Fails when the buffer length does not match the
    /// dimensions and format.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero ({}x{})", width, height));
        }
        let expected = expected_len(width, height, format)?;
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame length mismatch: expected {}, got {}",
                format,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            captured_at: Utc::now(),
            sequence: 0,
        })
    }

    /// Solid-colour frame, mostly for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8) -> Result<Self> {
        let len = expected_len(width, height, format)?;
        Self::new(vec![value; len], width, height, format)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Bilinear resize. Returns a clone when the size already matches.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize to {}x{}", width, height));
        }
        let data = match self.format {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => {
                resize_buffer::<Rgb<u8>>(&self.data, self.width, self.height, width, height)?
            }
            PixelFormat::Bgra32 => {
                resize_buffer::<Rgba<u8>>(&self.data, self.width, self.height, width, height)?
            }
            PixelFormat::Gray8 => {
                resize_buffer::<Luma<u8>>(&self.data, self.width, self.height, width, height)?
            }
        };
        Ok(Frame {
            data,
            width,
            height,
            format: self.format,
            captured_at: self.captured_at,
            sequence: self.sequence,
        })
    }

    /// Convert to a three-channel layout. Only `Bgr24` and `Rgb24` are valid
    /// targets; converting to the current format is a clone.
    pub fn to_format(&self, target: PixelFormat) -> Result<Frame> {
        if target == self.format {
            return Ok(self.clone());
        }
        let pixel_count = (self.width as usize) * (self.height as usize);
        let mut out = Vec::with_capacity(pixel_count * 3);
        match (self.format, target) {
            (PixelFormat::Bgr24, PixelFormat::Rgb24) | (PixelFormat::Rgb24, PixelFormat::Bgr24) => {
                for px in self.data.chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            (PixelFormat::Bgra32, PixelFormat::Bgr24) => {
                for px in self.data.chunks_exact(4) {
                    out.extend_from_slice(&px[..3]);
                }
            }
            (PixelFormat::Bgra32, PixelFormat::Rgb24) => {
                for px in self.data.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            (PixelFormat::Gray8, PixelFormat::Bgr24 | PixelFormat::Rgb24) => {
                for &luma in &self.data {
                    out.extend_from_slice(&[luma, luma, luma]);
                }
            }
            (from, to) => {
                return Err(anyhow!("unsupported pixel conversion {:?} -> {:?}", from, to));
            }
        }
        Ok(Frame {
            data: out,
            width: self.width,
            height: self.height,
            format: target,
            captured_at: self.captured_at,
            sequence: self.sequence,
        })
    }
}

fn expected_len(width: u32, height: u32, format: PixelFormat) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(format.bytes_per_pixel()))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn resize_buffer<P>(data: &[u8], width: u32, height: u32, out_w: u32, out_h: u32) -> Result<Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let image = ImageBuffer::<P, &[u8]>::from_raw(width, height, data)
        .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", width, height))?;
    Ok(imageops::resize(&image, out_w, out_h, FilterType::Triangle).into_raw())
}
