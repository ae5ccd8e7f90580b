//! Per-region photometric edit compositor.
//!
//! Regions are edited one after another, in ascending region id, on a shared
//! floating-point working copy of the image. Within a region the operations
//! run in a fixed order: brightness, contrast, gamma, hue/saturation,
//! sharpen, noise, opacity blend. Pixels outside every edited region are
//! copied from the input unchanged.

use crate::error::VisionError;
use crate::utils::{gaussian_kernel, hsv_to_rgb, is_grayscale, rgb_to_hsv};
use image::RgbImage;
use maskwork_core::config::CompositorConfig;
use maskwork_core::{EditParams, Mask};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const NOISE_SEED_MODULUS: u64 = (1 << 32) - 1;
const NOISE_SEED_OFFSET: u64 = 13;

/// Seed of the noise field for a region; depends only on its size and id.
pub fn noise_seed(pixel_count: usize, region_id: u64) -> u64 {
    (pixel_count as u64).wrapping_mul(region_id.wrapping_add(NOISE_SEED_OFFSET)) % NOISE_SEED_MODULUS
}

/// Zero-mean Gaussian samples, three per pixel, reproducible for a given
/// pixel count and region id.
pub fn noise_field(pixel_count: usize, region_id: u64, std_dev: f32) -> Vec<[f32; 3]> {
    let mut rng = StdRng::seed_from_u64(noise_seed(pixel_count, region_id));
    let mut spare: Option<f32> = None;
    let mut sample = move || -> f32 {
        if let Some(v) = spare.take() {
            return v;
        }
        // Box-Muller; 1 - u keeps the log argument in (0, 1]
        let u1 = 1.0 - rng.gen::<f64>();
        let u2 = rng.gen::<f64>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = std::f64::consts::TAU * u2;
        spare = Some((radius * theta.sin()) as f32);
        (radius * theta.cos()) as f32
    };
    (0..pixel_count)
        .map(|_| [sample() * std_dev, sample() * std_dev, sample() * std_dev])
        .collect()
}

pub struct Compositor {
    kernel: Vec<f32>,
    radius: i64,
    grayscale_tolerance: u8,
}

impl Compositor {
    pub fn new(config: &CompositorConfig) -> Self {
        Self {
            kernel: gaussian_kernel(config.sharpen_sigma, config.sharpen_radius),
            radius: config.sharpen_radius as i64,
            grayscale_tolerance: config.grayscale_tolerance,
        }
    }

    /// Apply `edits[id]` inside `masks[id]` for every id present in both maps.
    ///
    /// Edits without a matching mask are skipped. Every mask must share the
    /// image dimensions.
    pub fn apply(
        &self,
        image: &RgbImage,
        masks: &HashMap<u64, &Mask>,
        edits: &BTreeMap<u64, EditParams>,
    ) -> Result<RgbImage, VisionError> {
        if edits.is_empty() {
            return Ok(image.clone());
        }
        let (width, height) = image.dimensions();
        let grayscale = is_grayscale(image, self.grayscale_tolerance);
        let mut work: Vec<f32> = image.as_raw().iter().map(|v| *v as f32 / 255.0).collect();
        let mut touched = vec![false; width as usize * height as usize];

        for (&region_id, edit) in edits {
            let Some(mask) = masks.get(&region_id) else {
                debug!("No mask for region {}; edit skipped", region_id);
                continue;
            };
            if mask.dimensions() != (width, height) {
                return Err(VisionError::InvalidInput(format!(
                    "mask {} is {}x{} but the image is {}x{}",
                    region_id,
                    mask.width(),
                    mask.height(),
                    width,
                    height
                )));
            }
            edit.validate()?;
            let indices = mask.indices();
            if indices.is_empty() {
                continue;
            }
            self.edit_region(&mut work, width, height, &indices, region_id, edit, grayscale);
            for &i in &indices {
                touched[i] = true;
            }
        }

        let mut out = image.clone();
        let raw: &mut [u8] = &mut out;
        for (i, _) in touched.iter().enumerate().filter(|(_, t)| **t) {
            for c in 0..3 {
                raw[i * 3 + c] = quantize(work[i * 3 + c]);
            }
        }
        Ok(out)
    }

    /// Single-region convenience used when composing templates in sequence
    pub fn apply_region(
        &self,
        image: &RgbImage,
        region_id: u64,
        mask: &Mask,
        edit: &EditParams,
    ) -> Result<RgbImage, VisionError> {
        let masks = HashMap::from([(region_id, mask)]);
        let edits = BTreeMap::from([(region_id, *edit)]);
        self.apply(image, &masks, &edits)
    }

    #[allow(clippy::too_many_arguments)]
    fn edit_region(
        &self,
        work: &mut [f32],
        width: u32,
        height: u32,
        indices: &[usize],
        region_id: u64,
        edit: &EditParams,
        grayscale: bool,
    ) {
        let before = gather(work, indices);
        let mut region = before.clone();

        if edit.brightness != 0.0 {
            map_channels(&mut region, |v| v + edit.brightness);
        }
        if edit.contrast != 0.0 {
            map_channels(&mut region, |v| (v - 0.5) * (1.0 + edit.contrast) + 0.5);
        }
        if edit.gamma != 0.0 {
            let exponent = 1.0 / (1.0 + edit.gamma).max(1e-3);
            map_channels(&mut region, |v| v.powf(exponent));
        }
        if !grayscale && edit.touches_color() {
            let hue_shift = edit.hue.unwrap_or(0.0) / 360.0;
            let saturation_scale = 1.0 + edit.saturation.unwrap_or(0.0);
            for px in region.iter_mut() {
                let [h, s, v] = rgb_to_hsv(*px);
                let h = (h + hue_shift).rem_euclid(1.0);
                let s = (s * saturation_scale).clamp(0.0, 1.0);
                *px = clamp_px(hsv_to_rgb([h, s, v]));
            }
        }
        scatter(work, indices, &region);

        if edit.sharpen > 0.0 {
            let blurred = self.blur_at(work, width, height, indices);
            for (px, b) in region.iter_mut().zip(blurred.iter()) {
                for c in 0..3 {
                    px[c] = (px[c] + edit.sharpen * (px[c] - b[c])).clamp(0.0, 1.0);
                }
            }
            scatter(work, indices, &region);
        }

        if edit.noise > 0.0 {
            let noise = noise_field(indices.len(), region_id, edit.noise);
            for (px, n) in region.iter_mut().zip(noise.iter()) {
                for c in 0..3 {
                    px[c] = (px[c] + n[c]).clamp(0.0, 1.0);
                }
            }
            scatter(work, indices, &region);
        }

        if let Some(opacity) = edit.effective_opacity() {
            for (px, orig) in region.iter_mut().zip(before.iter()) {
                for c in 0..3 {
                    px[c] = opacity * px[c] + (1.0 - opacity) * orig[c];
                }
            }
            scatter(work, indices, &region);
        }
    }

    /// Gaussian blur of the working buffer sampled at `indices`, edges clamped
    fn blur_at(&self, work: &[f32], width: u32, height: u32, indices: &[usize]) -> Vec<[f32; 3]> {
        let (w, h) = (width as i64, height as i64);
        indices
            .iter()
            .map(|&idx| {
                let x = idx as i64 % w;
                let y = idx as i64 / w;
                let mut acc = [0.0f32; 3];
                for (ky, wy) in self.kernel.iter().enumerate() {
                    let sy = (y + ky as i64 - self.radius).clamp(0, h - 1);
                    for (kx, wx) in self.kernel.iter().enumerate() {
                        let sx = (x + kx as i64 - self.radius).clamp(0, w - 1);
                        let base = ((sy * w + sx) * 3) as usize;
                        let weight = wy * wx;
                        for c in 0..3 {
                            acc[c] += weight * work[base + c];
                        }
                    }
                }
                acc
            })
            .collect()
    }
}

fn gather(work: &[f32], indices: &[usize]) -> Vec<[f32; 3]> {
    indices
        .iter()
        .map(|&i| [work[i * 3], work[i * 3 + 1], work[i * 3 + 2]])
        .collect()
}

fn scatter(work: &mut [f32], indices: &[usize], region: &[[f32; 3]]) {
    for (&i, px) in indices.iter().zip(region.iter()) {
        work[i * 3..i * 3 + 3].copy_from_slice(px);
    }
}

fn map_channels(region: &mut [[f32; 3]], f: impl Fn(f32) -> f32) {
    for px in region.iter_mut() {
        for v in px.iter_mut() {
            *v = f(*v).clamp(0.0, 1.0);
        }
    }
}

fn clamp_px(px: [f32; 3]) -> [f32; 3] {
    [px[0].clamp(0.0, 1.0), px[1].clamp(0.0, 1.0), px[2].clamp(0.0, 1.0)]
}

fn quantize(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}
