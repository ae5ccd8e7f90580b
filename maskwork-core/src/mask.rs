//! Binary region masks and their portable PNG encoding.
//!
//! Masks cross every boundary as single-channel PNG rasters: `true` pixels
//! are written at full intensity, `false` at zero. Decoding thresholds at the
//! midpoint so anti-aliased or re-compressed masks still round-trip.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

/// Decoded intensities strictly above this value become `true`.
pub const MASK_THRESHOLD: u8 = 127;

/// Inclusive pixel bounding box `[xmin, ymin, xmax, ymax]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [u32; 4]);

impl BoundingBox {
    pub fn xmin(&self) -> u32 {
        self.0[0]
    }

    pub fn ymin(&self) -> u32 {
        self.0[1]
    }

    pub fn xmax(&self) -> u32 {
        self.0[2]
    }

    pub fn ymax(&self) -> u32 {
        self.0[3]
    }
}

/// Boolean 2D array, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl Mask {
    /// All-false mask
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    /// All-true mask covering the whole frame
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![true; width as usize * height as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut bits = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                bits.push(f(x, y));
            }
        }
        Self { width, height, bits }
    }

    /// Mask with the inclusive rectangle `[x0, x1] x [y0, y1]` set
    pub fn from_rect(width: u32, height: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self::from_fn(width, height, |x, y| x >= x0 && x <= x1 && y >= y0 && y <= y1)
    }

    pub fn from_bits(width: u32, height: u32, bits: Vec<bool>) -> Result<Self> {
        if bits.len() != width as usize * height as usize {
            return Err(Error::InvalidInput(format!(
                "mask buffer has {} entries, expected {}x{}",
                bits.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, bits })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.bits[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.width && y < self.height {
            let idx = y as usize * self.width as usize + x as usize;
            self.bits[idx] = value;
        }
    }

    /// Number of `true` pixels
    pub fn area(&self) -> u64 {
        self.bits.iter().filter(|b| **b).count() as u64
    }

    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|b| *b)
    }

    /// Flat indices (`y * width + x`) of every `true` pixel, in row-major order
    pub fn indices(&self) -> Vec<usize> {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| if *b { Some(i) } else { None })
            .collect()
    }

    /// Bounding box and area; `([0, 0, 0, 0], 0)` for an empty mask.
    pub fn bbox_and_area(&self) -> (BoundingBox, u64) {
        let mut xmin = u32::MAX;
        let mut ymin = u32::MAX;
        let mut xmax = 0;
        let mut ymax = 0;
        let mut area = 0u64;

        for y in 0..self.height {
            let row = y as usize * self.width as usize;
            for x in 0..self.width {
                if self.bits[row + x as usize] {
                    xmin = xmin.min(x);
                    ymin = ymin.min(y);
                    xmax = xmax.max(x);
                    ymax = ymax.max(y);
                    area += 1;
                }
            }
        }

        if area == 0 {
            return (BoundingBox::default(), 0);
        }
        (BoundingBox([xmin, ymin, xmax, ymax]), area)
    }

    /// In-place union; both masks must share dimensions
    pub fn union_with(&mut self, other: &Mask) -> Result<()> {
        if self.dimensions() != other.dimensions() {
            return Err(Error::InvalidInput(format!(
                "cannot union {}x{} mask with {}x{} mask",
                self.width, self.height, other.width, other.height
            )));
        }
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        Ok(())
    }
}

/// Encode as an 8-bit grayscale PNG (true -> 255, false -> 0)
pub fn encode(mask: &Mask) -> Result<Vec<u8>> {
    let raw: Vec<u8> = mask.bits.iter().map(|b| if *b { 255 } else { 0 }).collect();
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(&raw, mask.width, mask.height, ColorType::L8)
        .map_err(|e| Error::ProcessingFailure(format!("failed to encode mask: {}", e)))?;
    Ok(out)
}

/// Decode any raster; intensities above the midpoint become `true`
pub fn decode(bytes: &[u8]) -> Result<Mask> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| Error::InvalidMaskFormat(e.to_string()))?;
    let luma = img.to_luma8();
    let (width, height) = luma.dimensions();
    let bits = luma.as_raw().iter().map(|v| *v > MASK_THRESHOLD).collect();
    Ok(Mask { width, height, bits })
}

pub fn encode_base64(mask: &Mask) -> Result<String> {
    Ok(BASE64.encode(encode(mask)?))
}

pub fn decode_base64(data: &str) -> Result<Mask> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| Error::InvalidMaskFormat(format!("invalid base64: {}", e)))?;
    decode(&bytes)
}
