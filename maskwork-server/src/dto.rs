//! Request and response bodies of the service operations

use maskwork_core::{
    BoundingBox, ComponentId, DatasetId, EditParams, ImageId, PointPrompt, PointSummary,
    SessionId, TemplateId,
};
use maskwork_eye::CacheStats;
use maskwork_storage::ImageIndexEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub model_loaded: bool,
    pub model_id: Option<String>,
    pub model_error: Option<String>,
    pub cache: CacheStats,
    pub sessions: usize,
    pub datasets: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSessionResponse {
    pub session_id: SessionId,
    pub width: u32,
    pub height: u32,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRequest {
    pub session_id: SessionId,
    #[serde(default)]
    pub points: Vec<PointPrompt>,
    #[serde(default = "default_true")]
    pub accumulate: bool,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskCandidate {
    /// 1-based
    pub rank: usize,
    pub score: f32,
    pub area: u64,
    pub bbox: BoundingBox,
    /// Base64 PNG
    pub mask_png: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentResponse {
    pub session_id: SessionId,
    pub candidates: Vec<MaskCandidate>,
    pub points: Vec<PointPrompt>,
    pub point_summary: PointSummary,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveComponentRequest {
    pub session_id: SessionId,
    /// Base64 PNG; intensities above the midpoint are inside
    pub mask_png: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentEdit {
    pub component_id: ComponentId,
    #[serde(flatten)]
    pub params: EditParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub session_id: SessionId,
    #[serde(default)]
    pub edits: Vec<ComponentEdit>,
    #[serde(default)]
    pub export_mask: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// Base64 PNG of the edited image
    pub image_png: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_png: Option<String>,
    pub applied: Vec<ComponentId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitDatasetResponse {
    pub dataset_id: DatasetId,
    pub images: Vec<ImageIndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveTemplateRequest {
    pub dataset_id: DatasetId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "class")]
    pub class: Option<String>,
    pub points: Vec<PointPrompt>,
    #[serde(default)]
    pub image_filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub dataset_id: DatasetId,
    pub image_id: ImageId,
    /// Restrict to these templates, in this order; all templates when absent
    #[serde(default)]
    pub template_ids: Option<Vec<TemplateId>>,
    #[serde(default)]
    pub edits: HashMap<TemplateId, EditParams>,
    #[serde(default)]
    pub export_mask: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub image_id: ImageId,
    pub image_png: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_png: Option<String>,
    pub applied: Vec<TemplateId>,
    pub skipped: Vec<TemplateId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub dataset_id: DatasetId,
    #[serde(default)]
    pub template_ids: Option<Vec<TemplateId>>,
    #[serde(default)]
    pub edits: HashMap<TemplateId, EditParams>,
    #[serde(default)]
    pub export_mask: bool,
}
