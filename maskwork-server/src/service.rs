//! Transport-agnostic service facade.
//!
//! One async method per operation. Decoding, inference and compositing run
//! on the blocking pool; the stores are only locked for map access.

use crate::dto::*;
use crate::events::BatchEvent;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use maskwork_core::{
    mask, ComponentId, ComponentInfo, DatasetId, EditParams, Error, Mask, MaskworkConfig, Result, SessionId,
    Template,
};
use maskwork_eye::models::RegionGrowLoader;
use maskwork_eye::utils::encode_png;
use maskwork_eye::{
    apply_templates_for_image, BatchInput, BatchMode, BatchPipeline, BatchRun, CacheKey, Compositor,
    EmbeddingCache, ModelManager, SegmentationAdapter,
};
use maskwork_storage::{
    DatasetRepository, DatasetStore, ImageIndexEntry, InMemoryRepository, IngestArchive, IngestFile,
    SessionStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

struct Inner {
    config: MaskworkConfig,
    sessions: SessionStore,
    datasets: DatasetStore,
    models: Arc<ModelManager>,
    cache: Arc<EmbeddingCache>,
    adapter: Arc<SegmentationAdapter>,
    compositor: Arc<Compositor>,
    pipeline: BatchPipeline,
}

#[derive(Clone)]
pub struct MaskworkService {
    inner: Arc<Inner>,
}

impl MaskworkService {
    /// Service with the built-in region-grow loader and an in-memory repository
    pub fn new(config: MaskworkConfig) -> Self {
        let models = Arc::new(ModelManager::new(
            Arc::new(config.model.clone()),
            Arc::new(RegionGrowLoader),
        ));
        Self::from_parts(config, models, Some(Arc::new(InMemoryRepository::new())))
    }

    pub fn from_parts(
        config: MaskworkConfig,
        models: Arc<ModelManager>,
        repository: Option<Arc<dyn DatasetRepository>>,
    ) -> Self {
        let cache = Arc::new(EmbeddingCache::new(config.cache.max_entries));
        let adapter = Arc::new(SegmentationAdapter::new(models.clone(), cache.clone()));
        let compositor = Arc::new(Compositor::new(&config.compositor));
        let pipeline = BatchPipeline::new(adapter.clone(), compositor.clone());
        let datasets = match repository {
            Some(repo) => DatasetStore::with_repository(config.dataset.clone(), repo),
            None => DatasetStore::new(config.dataset.clone()),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: SessionStore::new(),
                datasets,
                models,
                cache,
                adapter,
                compositor,
                pipeline,
            }),
        }
    }

    pub fn config(&self) -> &MaskworkConfig {
        &self.inner.config
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.inner.models
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(inner.as_ref()))
            .await
            .map_err(|e| Error::ProcessingFailure(format!("blocking task failed: {}", e)))?
    }

    /// Load the model now when `model.warm_on_start` is set. A failed load is
    /// logged and leaves dependent operations reporting unavailability.
    pub async fn warm_up(&self) -> Result<bool> {
        if !self.inner.config.model.warm_on_start {
            return Ok(false);
        }
        self.blocking(|inner| match inner.models.ensure_loaded() {
            Ok(model) => {
                info!("Model warmed: {}", model.model_id());
                Ok(true)
            }
            Err(e) => {
                warn!("Model warm-up failed: {}", e);
                Ok(false)
            }
        })
        .await
    }

    pub async fn health(&self) -> HealthReport {
        let status = self.inner.models.status();
        HealthReport {
            status: "ok",
            model_loaded: status.loaded,
            model_id: status.model_id,
            model_error: status.last_error,
            cache: self.inner.cache.stats(),
            sessions: self.inner.sessions.len(),
            datasets: self.inner.datasets.len(),
        }
    }

    // ---- sessions ----

    pub async fn init_session(&self, image_bytes: Vec<u8>) -> Result<InitSessionResponse> {
        self.blocking(move |inner| {
            let (session_id, image) = inner.sessions.init(&image_bytes)?;
            Ok(InitSessionResponse {
                session_id,
                width: image.width(),
                height: image.height(),
                fingerprint: image.fingerprint().to_string(),
            })
        })
        .await
    }

    /// Add prompts to a session and return the ranked candidate masks.
    pub async fn segment(&self, req: SegmentRequest) -> Result<SegmentResponse> {
        self.blocking(move |inner| {
            let existing = inner.sessions.points(&req.session_id)?;
            let resulting_empty = req.points.is_empty() && (!req.accumulate || existing.is_empty());
            if resulting_empty {
                return Err(Error::InvalidInput("no points provided".to_string()));
            }
            let points = inner
                .sessions
                .add_points(&req.session_id, &req.points, req.accumulate)?;
            let image = inner.sessions.image(&req.session_id)?;

            let key = CacheKey::for_session(&req.session_id, image.fingerprint());
            let top_k = req.top_k.unwrap_or(inner.config.batch.default_top_k).max(1);
            let ranked = inner
                .adapter
                .predict_ranked(image.pixels(), &points, Some(&key), top_k)?;

            let model_id = inner.models.current().map(|m| m.model_id().to_string());
            if let Some(id) = &model_id {
                inner.sessions.set_model_id(&req.session_id, id)?;
            }

            let candidates = ranked
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let (bbox, area) = p.mask.bbox_and_area();
                    Ok(MaskCandidate {
                        rank: i + 1,
                        score: p.score,
                        area,
                        bbox,
                        mask_png: mask::encode_base64(&p.mask)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(SegmentResponse {
                session_id: req.session_id,
                candidates,
                point_summary: maskwork_core::PointSummary::of(&points),
                points,
                model_id,
            })
        })
        .await
    }

    pub async fn save_component(&self, req: SaveComponentRequest) -> Result<ComponentInfo> {
        self.blocking(move |inner| {
            // fail on an unknown session before paying for the decode
            inner.sessions.image(&req.session_id)?;
            if req.mask_png.trim().is_empty() {
                return Err(Error::InvalidInput("mask_png required".to_string()));
            }
            let decoded = mask::decode_base64(&req.mask_png)?;
            inner
                .sessions
                .save_component(&req.session_id, decoded, req.score, req.name)
        })
        .await
    }

    pub async fn components(&self, session_id: SessionId) -> Result<Vec<ComponentInfo>> {
        self.inner.sessions.list_components(&session_id)
    }

    /// PNG of one saved component's mask
    pub async fn component_mask(&self, session_id: SessionId, component_id: ComponentId) -> Result<Vec<u8>> {
        self.blocking(move |inner| inner.sessions.export_component_mask(&session_id, component_id))
            .await
    }

    pub async fn delete_component(&self, session_id: SessionId, component_id: ComponentId) -> Result<()> {
        self.inner.sessions.delete_component(&session_id, component_id)
    }

    /// Drop a session and its cached embedding
    pub async fn evict_session(&self, session_id: SessionId) -> bool {
        let removed = self.inner.sessions.evict(&session_id);
        self.inner
            .cache
            .invalidate_prefix(&CacheKey::session_prefix(&session_id));
        removed
    }

    /// Apply component edits in list order on the session's original image.
    ///
    /// Unknown component ids are skipped.
    pub async fn apply(&self, req: ApplyRequest) -> Result<ApplyResponse> {
        self.blocking(move |inner| {
            let image = inner.sessions.image(&req.session_id)?;
            let ids: Vec<ComponentId> = req.edits.iter().map(|e| e.component_id).collect();
            let masks: HashMap<ComponentId, Arc<Mask>> = inner
                .sessions
                .component_masks(&req.session_id, &ids)?
                .into_iter()
                .collect();

            let (width, height) = image.dimensions();
            let mut output = image.pixels().clone();
            let mut union = Mask::new(width, height);
            let mut applied = Vec::new();
            for edit in &req.edits {
                let Some(region) = masks.get(&edit.component_id) else {
                    debug!("Session {} has no component {}", req.session_id, edit.component_id);
                    continue;
                };
                output = inner
                    .compositor
                    .apply_region(&output, edit.component_id.0, region, &edit.params)?;
                union.union_with(region)?;
                applied.push(edit.component_id);
            }

            let mask_png = if req.export_mask {
                Some(mask::encode_base64(&union)?)
            } else {
                None
            };
            Ok(ApplyResponse {
                image_png: BASE64.encode(encode_png(&output)?),
                mask_png,
                applied,
            })
        })
        .await
    }

    // ---- datasets ----

    pub async fn init_dataset(
        &self,
        files: Vec<IngestFile>,
        archives: Vec<IngestArchive>,
    ) -> Result<InitDatasetResponse> {
        self.blocking(move |inner| {
            let (dataset_id, images) = inner.datasets.init_dataset(files, archives)?;
            Ok(InitDatasetResponse { dataset_id, images })
        })
        .await
    }

    pub async fn dataset_images(&self, dataset_id: DatasetId) -> Result<Vec<ImageIndexEntry>> {
        self.inner.datasets.index(&dataset_id)
    }

    pub async fn save_template(&self, req: SaveTemplateRequest) -> Result<Template> {
        let name = req.name.unwrap_or_default();
        self.inner
            .datasets
            .save_template(&req.dataset_id, &name, req.class, req.points, req.image_filename)
    }

    pub async fn list_templates(&self, dataset_id: DatasetId) -> Result<Vec<Template>> {
        self.inner.datasets.list_templates(&dataset_id)
    }

    pub async fn delete_dataset(&self, dataset_id: DatasetId) -> Result<()> {
        self.inner.datasets.delete_dataset(&dataset_id)?;
        self.inner
            .cache
            .invalidate_prefix(&CacheKey::dataset_prefix(&dataset_id));
        Ok(())
    }

    /// Apply templates to a single dataset image without streaming
    pub async fn preview_templates(&self, req: PreviewRequest) -> Result<PreviewResponse> {
        self.blocking(move |inner| {
            let image = inner.datasets.image(&req.dataset_id, &req.image_id)?;
            let templates = inner
                .datasets
                .select_templates(&req.dataset_id, req.template_ids.as_deref())?;
            let key = CacheKey::for_dataset_image(&req.dataset_id, &image.id, image.image.fingerprint());
            let outcome = apply_templates_for_image(
                &inner.adapter,
                &inner.compositor,
                &image.image,
                &templates,
                &req.edits,
                image.class.as_deref(),
                Some(&key),
            )?;
            let mask_png = if req.export_mask {
                Some(mask::encode_base64(&outcome.union_mask)?)
            } else {
                None
            };
            Ok(PreviewResponse {
                image_id: image.id.clone(),
                image_png: BASE64.encode(encode_png(&outcome.image)?),
                mask_png,
                applied: outcome.applied,
                skipped: outcome.skipped.into_iter().map(|(id, _)| id).collect(),
            })
        })
        .await
    }

    /// Stream every dataset image through the selected templates, in order.
    ///
    /// Dropping the returned stream stops processing before the next image.
    pub async fn apply_stream(&self, req: StreamRequest) -> Result<ReceiverStream<BatchEvent>> {
        let templates = self
            .inner
            .datasets
            .select_templates(&req.dataset_id, req.template_ids.as_deref())?;
        let images = self.inner.datasets.images(&req.dataset_id)?;
        info!(
            "Streaming {} templates over {} images of dataset {}",
            templates.len(),
            images.len(),
            req.dataset_id
        );

        let inputs: Vec<BatchInput> = images
            .iter()
            .map(|img| {
                BatchInput::decoded(img.id.clone(), img.filename.clone(), img.image.clone())
                    .with_class(img.class.clone())
                    .with_cache_key(CacheKey::for_dataset_image(
                        &req.dataset_id,
                        &img.id,
                        img.image.fingerprint(),
                    ))
            })
            .collect();
        let run = self.inner.pipeline.run_template_batch(
            inputs,
            Arc::new(templates),
            Arc::new(req.edits),
            req.export_mask,
        );
        Ok(self.stream(run))
    }

    /// Stream one edit over arbitrary encoded images
    pub async fn run_batch(
        &self,
        inputs: Vec<BatchInput>,
        mode: BatchMode,
        edit: EditParams,
        export_mask: bool,
    ) -> Result<ReceiverStream<BatchEvent>> {
        edit.validate()?;
        let run = self.inner.pipeline.run_batch(inputs, mode, edit, export_mask);
        Ok(self.stream(run))
    }

    fn stream<I>(&self, run: BatchRun<I>) -> ReceiverStream<BatchEvent>
    where
        I: Iterator<Item = BatchInput> + Send + 'static,
    {
        // mpsc::channel panics on zero
        let (tx, rx) = mpsc::channel(self.inner.config.batch.channel_capacity.max(1));
        tokio::task::spawn_blocking(move || {
            for record in run {
                if tx.blocking_send(BatchEvent::from(record)).is_err() {
                    debug!("Stream consumer went away; stopping batch");
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}
