//! Point-prompted segmentation over the loaded model

use crate::cache::{CacheKey, EmbeddingCache};
use crate::error::VisionError;
use crate::models::{Embedding, ModelManager, SegmentationModel};
use image::RgbImage;
use maskwork_core::{Mask, PointPrompt};
use parking_lot::{Mutex, MutexGuard};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// A ranked mask candidate at source resolution
#[derive(Debug, Clone)]
pub struct Prediction {
    pub mask: Mask,
    pub score: f32,
}

pub struct SegmentationAdapter {
    models: Arc<ModelManager>,
    cache: Arc<EmbeddingCache>,
    inference_lock: Mutex<()>,
}

impl SegmentationAdapter {
    pub fn new(models: Arc<ModelManager>, cache: Arc<EmbeddingCache>) -> Self {
        Self {
            models,
            cache,
            inference_lock: Mutex::new(()),
        }
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Loads the model if needed; false when no checkpoint can be used
    pub fn is_available(&self) -> bool {
        self.models.ensure_loaded().is_ok()
    }

    /// Best candidate, or `None` when the model is unavailable, the prompt is
    /// unusable or inference fails. Failures are logged, never raised.
    pub fn predict(
        &self,
        image: &RgbImage,
        points: &[PointPrompt],
        cache_key: Option<&CacheKey>,
    ) -> Option<Prediction> {
        match self.predict_ranked(image, points, cache_key, 1) {
            Ok(ranked) => ranked.into_iter().next(),
            Err(e) => {
                warn!("Segmentation failed: {}", e);
                None
            }
        }
    }

    /// Up to `top_k` candidates, best first. Equal scores keep the order the
    /// model produced them in.
    pub fn predict_ranked(
        &self,
        image: &RgbImage,
        points: &[PointPrompt],
        cache_key: Option<&CacheKey>,
        top_k: usize,
    ) -> Result<Vec<Prediction>, VisionError> {
        if points.is_empty() {
            return Err(VisionError::InvalidInput("no points provided".to_string()));
        }
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(VisionError::InvalidInput("image has no pixels".to_string()));
        }

        let usable: Vec<&PointPrompt> = points.iter().filter(|p| p.is_valid()).collect();
        if usable.is_empty() {
            return Err(VisionError::InvalidInput(
                "point coordinates must be finite and within [0, 1]".to_string(),
            ));
        }
        let coords: Vec<(f32, f32)> = usable.iter().map(|p| p.to_pixel(width, height)).collect();
        let labels: Vec<bool> = usable.iter().map(|p| p.positive).collect();

        let model = self.models.ensure_loaded()?;
        let features = match cache_key {
            Some(key) => self
                .cache
                .get_or_compute(key, image, |img| self.embed(model.as_ref(), img))?,
            None => Arc::new(self.embed(model.as_ref(), image)?),
        };

        let candidates = {
            let _guard = self.exclusive(model.as_ref());
            model.predict(&features, &coords, &labels)?
        };
        let produced = candidates.len();

        let mut ranked: Vec<Prediction> = candidates
            .into_iter()
            .filter(|c| c.score.is_finite() && c.mask.dimensions() == (width, height))
            .map(|c| Prediction { mask: c.mask, score: c.score })
            .collect();
        // stable sort keeps first-encountered order among ties
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        ranked.truncate(top_k.max(1));

        debug!(
            "Segmented {}x{} with {} points: {} candidates, {} kept",
            width,
            height,
            coords.len(),
            produced,
            ranked.len()
        );
        metrics::counter!("maskwork_segmentations_total").increment(1);
        Ok(ranked)
    }

    fn embed(&self, model: &dyn SegmentationModel, image: &RgbImage) -> Result<Embedding, VisionError> {
        let _guard = self.exclusive(model);
        model.set_context(image)
    }

    fn exclusive(&self, model: &dyn SegmentationModel) -> Option<MutexGuard<'_, ()>> {
        if model.is_concurrency_safe() {
            None
        } else {
            Some(self.inference_lock.lock())
        }
    }
}
