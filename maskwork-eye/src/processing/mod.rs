//! Segmentation, compositing and batch processing

pub mod batch;
pub mod compositor;
pub mod segmentation;
pub mod templates;

pub use batch::{BatchFailure, BatchInput, BatchItem, BatchMode, BatchPipeline, BatchRecord, BatchRun, BatchSource, BatchSummary};
pub use compositor::{noise_field, noise_seed, Compositor};
pub use segmentation::{Prediction, SegmentationAdapter};
pub use templates::{apply_templates_for_image, SkipReason, TemplateOutcome};
