//! maskwork-eye: segmentation and region editing
//!
//! Wraps an external segmentation capability behind a model manager, caches
//! per-image embeddings, composites per-region photometric edits and drives
//! both across batches of images.

pub mod cache;
pub mod error;
pub mod models;
pub mod processing;
pub mod utils;

pub use cache::{CacheKey, CacheStats, EmbeddingCache};
pub use error::VisionError;
pub use models::{Candidate, Embedding, ModelLoader, ModelManager, SegmentationModel};
pub use processing::{
    apply_templates_for_image, BatchInput, BatchMode, BatchPipeline, BatchRecord, BatchRun,
    Compositor, Prediction, SegmentationAdapter, TemplateOutcome,
};
