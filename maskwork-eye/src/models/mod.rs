//! Segmentation capability, its loader and the lazily-loading manager

pub mod capability;
pub mod manager;
pub mod region_grow;

pub use capability::{Candidate, Embedding, ModelLoader, SegmentationModel};
pub use manager::{resolve_checkpoint, CheckpointResolution, ModelManager, ModelStatus};
pub use region_grow::{RegionGrowCheckpoint, RegionGrowLoader, RegionGrowModel};
