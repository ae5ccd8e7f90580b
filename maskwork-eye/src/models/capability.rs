//! The seam between the engine and a point-prompted segmentation model.

use crate::error::VisionError;
use image::RgbImage;
use maskwork_core::Mask;
use std::path::Path;
use std::sync::Arc;

/// Opaque per-image features produced by `set_context`.
///
/// Engines are free to choose the layout; `shape` describes how `values` is
/// laid out (row-major, outermost dimension first).
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, VisionError> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(VisionError::Model(format!(
                "embedding shape {:?} expects {} values, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn size_bytes(&self) -> usize {
        self.values.len() * std::mem::size_of::<f32>()
    }
}

/// One candidate mask at the resolution of the image the context was set from
#[derive(Debug, Clone)]
pub struct Candidate {
    pub mask: Mask,
    pub score: f32,
}

/// A point-prompted segmentation model.
///
/// `set_context` is the expensive step and its output is cached per image.
/// Points are pixel coordinates; `labels[i]` is true for a positive prompt.
pub trait SegmentationModel: Send + Sync {
    fn model_id(&self) -> &str;

    fn set_context(&self, image: &RgbImage) -> Result<Embedding, VisionError>;

    fn predict(
        &self,
        features: &Embedding,
        points: &[(f32, f32)],
        labels: &[bool],
    ) -> Result<Vec<Candidate>, VisionError>;

    /// Models that are not safe to call from several threads at once get an
    /// exclusive inference lock around every call.
    fn is_concurrency_safe(&self) -> bool {
        false
    }
}

/// Builds a model from a checkpoint file.
pub trait ModelLoader: Send + Sync {
    fn load(&self, checkpoint: &Path, model_type: &str)
        -> Result<Arc<dyn SegmentationModel>, VisionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_shape_check() {
        assert!(Embedding::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Embedding::new(vec![2, 3], vec![0.0; 5]).is_err());
        let e = Embedding::new(vec![4], vec![1.0; 4]).unwrap();
        assert_eq!(e.size_bytes(), 16);
        assert_eq!(e.shape(), &[4]);
    }
}
