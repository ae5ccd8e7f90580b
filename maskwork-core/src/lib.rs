//! maskwork-core: shared vocabulary of the maskwork engine
//!
//! Identifiers, point prompts, decoded source images, binary masks and their
//! PNG codec, typed edit parameters, the error taxonomy and configuration.

pub mod config;
pub mod edit;
pub mod error;
pub mod mask;
pub mod types;

pub use config::MaskworkConfig;
pub use edit::EditParams;
pub use error::{Error, ErrorKind, Result};
pub use mask::{BoundingBox, Mask};
pub use types::{
    fingerprint, infer_class_from_filename, Component, ComponentId, ComponentInfo, DatasetId,
    ImageId, PointPrompt, PointSummary, SessionId, SourceImage, Template, TemplateId,
};
