//! Lazy batch pipeline over a sequence of images.
//!
//! A run yields exactly one record per input, in input order, followed by a
//! single `Done` record. Failures are captured per item and never stop the
//! run. Nothing is retried.

use crate::cache::CacheKey;
use crate::error::VisionError;
use crate::processing::compositor::Compositor;
use crate::processing::segmentation::SegmentationAdapter;
use crate::processing::templates::apply_templates_for_image;
use crate::utils::encode_png;
use image::RgbImage;
use maskwork_core::{
    infer_class_from_filename, mask, EditParams, ImageId, Mask, PointPrompt, SourceImage, Template, TemplateId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::iter::FusedIterator;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Region selection used by `run_batch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchMode {
    /// The whole frame is one region
    #[serde(rename = "full-image")]
    FullImage,
    /// One positive prompt at the geometric center
    #[serde(rename = "single-center-point")]
    CenterPoint,
}

#[derive(Debug, Clone)]
pub enum BatchSource {
    Encoded(Vec<u8>),
    Decoded(Arc<SourceImage>),
}

#[derive(Debug, Clone)]
pub struct BatchInput {
    pub image_id: ImageId,
    pub filename: String,
    pub source: BatchSource,
    /// Explicit class; falls back to filename inference when absent
    pub class: Option<String>,
    pub cache_key: Option<CacheKey>,
}

impl BatchInput {
    pub fn encoded(image_id: ImageId, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            image_id,
            filename: filename.into(),
            source: BatchSource::Encoded(bytes),
            class: None,
            cache_key: None,
        }
    }

    pub fn decoded(image_id: ImageId, filename: impl Into<String>, image: Arc<SourceImage>) -> Self {
        Self {
            image_id,
            filename: filename.into(),
            source: BatchSource::Decoded(image),
            class: None,
            cache_key: None,
        }
    }

    pub fn with_class(mut self, class: Option<String>) -> Self {
        self.class = class;
        self
    }

    pub fn with_cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    fn resolve(&self) -> Result<Arc<SourceImage>, VisionError> {
        match &self.source {
            BatchSource::Encoded(bytes) => Ok(Arc::new(SourceImage::decode(bytes)?)),
            BatchSource::Decoded(image) => Ok(image.clone()),
        }
    }

    fn effective_class(&self) -> Option<String> {
        self.class.clone().or_else(|| infer_class_from_filename(&self.filename))
    }
}

/// Encoded result for one image
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub index: usize,
    pub image_id: ImageId,
    pub filename: String,
    pub image_png: Vec<u8>,
    pub mask_png: Option<Vec<u8>>,
    pub score: Option<f32>,
    /// Templates that contributed a region (template runs only)
    pub applied: Vec<TemplateId>,
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub index: usize,
    pub image_id: ImageId,
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub enum BatchRecord {
    Success(BatchItem),
    Failure(BatchFailure),
    /// Always the last record of a run
    Done(BatchSummary),
}

impl BatchRecord {
    pub fn is_done(&self) -> bool {
        matches!(self, BatchRecord::Done(_))
    }
}

struct ItemOutput {
    image: RgbImage,
    mask: Option<Mask>,
    score: Option<f32>,
    applied: Vec<TemplateId>,
}

type Processor = Box<dyn Fn(&BatchInput) -> Result<ItemOutput, VisionError> + Send>;

/// Single-pass iterator of batch records; not restartable.
pub struct BatchRun<I> {
    inputs: I,
    process: Processor,
    export_mask: bool,
    summary: BatchSummary,
    finished: bool,
}

impl<I> BatchRun<I> {
    fn new(inputs: I, process: Processor, export_mask: bool) -> Self {
        Self {
            inputs,
            process,
            export_mask,
            summary: BatchSummary::default(),
            finished: false,
        }
    }

    pub fn summary(&self) -> BatchSummary {
        self.summary
    }

    fn encode(&self, index: usize, input: &BatchInput, output: ItemOutput) -> Result<BatchItem, VisionError> {
        let image_png = encode_png(&output.image)?;
        let mask_png = match (self.export_mask, output.mask.as_ref()) {
            (true, Some(m)) => Some(mask::encode(m)?),
            _ => None,
        };
        Ok(BatchItem {
            index,
            image_id: input.image_id.clone(),
            filename: input.filename.clone(),
            image_png,
            mask_png,
            score: output.score,
            applied: output.applied,
        })
    }
}

impl<I: Iterator<Item = BatchInput>> Iterator for BatchRun<I> {
    type Item = BatchRecord;

    fn next(&mut self) -> Option<BatchRecord> {
        if self.finished {
            return None;
        }
        let Some(input) = self.inputs.next() else {
            self.finished = true;
            info!(
                "Batch complete: {} images, {} succeeded, {} failed",
                self.summary.total, self.summary.succeeded, self.summary.failed
            );
            return Some(BatchRecord::Done(self.summary));
        };

        let index = self.summary.total;
        self.summary.total += 1;
        let result = (self.process)(&input).and_then(|output| self.encode(index, &input, output));
        match result {
            Ok(item) => {
                self.summary.succeeded += 1;
                metrics::counter!("maskwork_batch_items_total", "outcome" => "success").increment(1);
                debug!("Batch item {} ({}) done", index, input.filename);
                Some(BatchRecord::Success(item))
            }
            Err(e) => {
                self.summary.failed += 1;
                metrics::counter!("maskwork_batch_items_total", "outcome" => "failure").increment(1);
                warn!("Batch item {} ({}) failed: {}", index, input.filename, e);
                Some(BatchRecord::Failure(BatchFailure {
                    index,
                    image_id: input.image_id,
                    filename: input.filename,
                    error: e.to_string(),
                }))
            }
        }
    }
}

impl<I: Iterator<Item = BatchInput>> FusedIterator for BatchRun<I> {}

/// Drives segmentation and compositing across many images
#[derive(Clone)]
pub struct BatchPipeline {
    adapter: Arc<SegmentationAdapter>,
    compositor: Arc<Compositor>,
}

impl BatchPipeline {
    pub fn new(adapter: Arc<SegmentationAdapter>, compositor: Arc<Compositor>) -> Self {
        Self { adapter, compositor }
    }

    /// Apply one edit to every image, selecting the region by `mode`.
    pub fn run_batch<I>(
        &self,
        images: I,
        mode: BatchMode,
        edit: EditParams,
        export_mask: bool,
    ) -> BatchRun<I::IntoIter>
    where
        I: IntoIterator<Item = BatchInput>,
    {
        let adapter = self.adapter.clone();
        let compositor = self.compositor.clone();
        let process: Processor = Box::new(move |input: &BatchInput| {
            let source = input.resolve()?;
            let (width, height) = source.dimensions();
            let (region, score) = match mode {
                BatchMode::FullImage => (Mask::full(width, height), None),
                BatchMode::CenterPoint => {
                    let center = [PointPrompt::positive(0.5, 0.5)];
                    let best = adapter
                        .predict_ranked(source.pixels(), &center, input.cache_key.as_ref(), 1)?
                        .into_iter()
                        .next()
                        .ok_or_else(|| VisionError::Processing("no mask at image center".to_string()))?;
                    (best.mask, Some(best.score))
                }
            };
            let image = compositor.apply_region(source.pixels(), 1, &region, &edit)?;
            Ok(ItemOutput {
                image,
                mask: Some(region),
                score,
                applied: Vec::new(),
            })
        });
        BatchRun::new(images.into_iter(), process, export_mask)
    }

    /// Apply `templates` in order to every image; see `apply_templates_for_image`.
    pub fn run_template_batch<I>(
        &self,
        images: I,
        templates: Arc<Vec<Template>>,
        edits: Arc<HashMap<TemplateId, EditParams>>,
        export_mask: bool,
    ) -> BatchRun<I::IntoIter>
    where
        I: IntoIterator<Item = BatchInput>,
    {
        let adapter = self.adapter.clone();
        let compositor = self.compositor.clone();
        let process: Processor = Box::new(move |input: &BatchInput| {
            let source = input.resolve()?;
            let class = input.effective_class();
            let outcome = apply_templates_for_image(
                &adapter,
                &compositor,
                &source,
                &templates,
                &edits,
                class.as_deref(),
                input.cache_key.as_ref(),
            )?;
            Ok(ItemOutput {
                image: outcome.image,
                mask: Some(outcome.union_mask),
                score: None,
                applied: outcome.applied,
            })
        });
        BatchRun::new(images.into_iter(), process, export_mask)
    }
}
