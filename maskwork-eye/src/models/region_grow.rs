//! Built-in classical segmentation engine.
//!
//! Grows a region outward from each positive prompt over 4-connected pixels
//! whose color stays within a tolerance of the seed. Negative prompts stop
//! the growth: a pixel is only accepted when it is closer in color to the
//! positive seed than to every negative seed. One candidate is produced per
//! tolerance in the checkpoint.

use crate::error::VisionError;
use crate::models::capability::{Candidate, Embedding, ModelLoader, SegmentationModel};
use image::RgbImage;
use maskwork_core::Mask;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Checkpoint payload: a JSON document with the color tolerances to try
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionGrowCheckpoint {
    pub tolerances: Vec<f32>,
}

impl Default for RegionGrowCheckpoint {
    fn default() -> Self {
        Self { tolerances: vec![0.08, 0.16, 0.32] }
    }
}

pub struct RegionGrowModel {
    id: String,
    tolerances: Vec<f32>,
}

impl RegionGrowModel {
    pub fn new(id: impl Into<String>, checkpoint: RegionGrowCheckpoint) -> Result<Self, VisionError> {
        if checkpoint.tolerances.is_empty() {
            return Err(VisionError::Model("checkpoint lists no tolerances".to_string()));
        }
        if checkpoint.tolerances.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(VisionError::Model("tolerances must be positive and finite".to_string()));
        }
        Ok(Self {
            id: id.into(),
            tolerances: checkpoint.tolerances,
        })
    }

    fn grow(
        &self,
        features: &[f32],
        width: usize,
        height: usize,
        seeds: &[usize],
        blockers: &[usize],
        tolerance: f32,
    ) -> (Vec<bool>, f32) {
        let plane = width * height;
        let color = |idx: usize| [features[idx], features[plane + idx], features[2 * plane + idx]];
        let blocker_colors: Vec<[f32; 3]> = blockers.iter().map(|&i| color(i)).collect();

        let mut bits = vec![false; plane];
        // growth never enters a negative seed
        let mut visited = vec![false; plane];
        for &b in blockers {
            visited[b] = true;
        }

        let mut dist_sum = 0.0f32;
        let mut count = 0usize;
        let mut queue = VecDeque::new();

        for &seed in seeds {
            if visited[seed] {
                continue;
            }
            let seed_color = color(seed);
            visited[seed] = true;
            bits[seed] = true;
            count += 1;
            queue.push_back(seed);

            while let Some(idx) = queue.pop_front() {
                let x = idx % width;
                let y = idx / width;
                let neighbours = [
                    (x > 0).then(|| idx - 1),
                    (x + 1 < width).then(|| idx + 1),
                    (y > 0).then(|| idx - width),
                    (y + 1 < height).then(|| idx + width),
                ];
                for next in neighbours.into_iter().flatten() {
                    if visited[next] {
                        continue;
                    }
                    let c = color(next);
                    let d = color_distance(&c, &seed_color);
                    if d > tolerance {
                        continue;
                    }
                    if blocker_colors.iter().any(|n| color_distance(&c, n) < d) {
                        continue;
                    }
                    visited[next] = true;
                    bits[next] = true;
                    dist_sum += d;
                    count += 1;
                    queue.push_back(next);
                }
            }
        }

        let homogeneity = if count > 0 {
            (1.0 - dist_sum / count as f32 / tolerance).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let coverage = count as f32 / plane.max(1) as f32;
        (bits, homogeneity * (1.0 - 0.5 * coverage))
    }
}

/// Euclidean RGB distance scaled to [0, 1]
fn color_distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    ((dr * dr + dg * dg + db * db) / 3.0).sqrt()
}

impl SegmentationModel for RegionGrowModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    /// Planar `[3, H, W]` normalized color
    fn set_context(&self, image: &RgbImage) -> Result<Embedding, VisionError> {
        let (w, h) = image.dimensions();
        let plane = w as usize * h as usize;
        if plane == 0 {
            return Err(VisionError::InvalidInput("image has no pixels".to_string()));
        }
        let mut values = vec![0.0f32; plane * 3];
        for (i, px) in image.pixels().enumerate() {
            values[i] = px[0] as f32 / 255.0;
            values[plane + i] = px[1] as f32 / 255.0;
            values[2 * plane + i] = px[2] as f32 / 255.0;
        }
        Embedding::new(vec![3, h as usize, w as usize], values)
    }

    fn predict(
        &self,
        features: &Embedding,
        points: &[(f32, f32)],
        labels: &[bool],
    ) -> Result<Vec<Candidate>, VisionError> {
        let [channels, height, width] = features.shape() else {
            return Err(VisionError::Model(format!("unexpected feature shape {:?}", features.shape())));
        };
        if *channels != 3 {
            return Err(VisionError::Model(format!("expected 3 channels, got {}", channels)));
        }
        if points.len() != labels.len() {
            return Err(VisionError::InvalidInput("points and labels differ in length".to_string()));
        }
        let (width, height) = (*width, *height);

        let to_index = |(x, y): (f32, f32)| {
            let xi = (x.round().max(0.0) as usize).min(width - 1);
            let yi = (y.round().max(0.0) as usize).min(height - 1);
            yi * width + xi
        };
        let seeds: Vec<usize> = points
            .iter()
            .zip(labels)
            .filter(|(_, positive)| **positive)
            .map(|(p, _)| to_index(*p))
            .collect();
        let blockers: Vec<usize> = points
            .iter()
            .zip(labels)
            .filter(|(_, positive)| !**positive)
            .map(|(p, _)| to_index(*p))
            .collect();

        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::with_capacity(self.tolerances.len());
        for &tolerance in &self.tolerances {
            let (bits, score) = self.grow(features.values(), width, height, &seeds, &blockers, tolerance);
            let mask = Mask::from_bits(width as u32, height as u32, bits)?;
            if mask.is_empty() {
                continue;
            }
            candidates.push(Candidate { mask, score });
        }
        Ok(candidates)
    }

    fn is_concurrency_safe(&self) -> bool {
        true
    }
}

/// Loads `RegionGrowModel` from a JSON checkpoint
pub struct RegionGrowLoader;

impl ModelLoader for RegionGrowLoader {
    fn load(&self, checkpoint: &Path, model_type: &str) -> Result<Arc<dyn SegmentationModel>, VisionError> {
        let raw = fs::read(checkpoint)?;
        let parsed: RegionGrowCheckpoint = serde_json::from_slice(&raw)
            .map_err(|e| VisionError::Model(format!("unreadable checkpoint: {}", e)))?;
        let id = format!("{}:{}:cpu", model_type, checkpoint.display());
        let model = RegionGrowModel::new(id, parsed)?;
        info!("Region-grow model loaded from {:?}", checkpoint);
        Ok(Arc::new(model))
    }
}
