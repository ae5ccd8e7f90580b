//! Queue-driven batch worker.
//!
//! A job names a dataset prefix in the input object store and an output
//! prefix. The worker ingests every accepted image under the prefix, saves
//! the job's templates, streams the template batch and uploads each edited
//! image as `{output_prefix}{filename}` as soon as it arrives. Output names
//! depend only on the source filename, so re-running a job overwrites rather
//! than duplicates.

use crate::dto::{SaveTemplateRequest, StreamRequest};
use crate::events::{BatchEvent, StreamOutcome};
use crate::service::MaskworkService;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use maskwork_core::{DatasetId, EditParams, Error, PointPrompt, Result, TemplateId};
use maskwork_eye::models::CheckpointResolution;
use maskwork_storage::IngestFile;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Object key of the checkpoint in the models store
pub const DEFAULT_MODEL_KEY: &str = "sam_vit_b.pth";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "class")]
    pub class: Option<String>,
    pub points: Vec<PointPrompt>,
    #[serde(default)]
    pub image_filename: Option<String>,
    /// Falls back to the job-level edit when absent
    #[serde(default)]
    pub edits: Option<EditParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub dataset_prefix: String,
    pub output_prefix: String,
    #[serde(default)]
    pub templates: Vec<JobTemplate>,
    #[serde(default)]
    pub edits: EditParams,
}

impl JobSpec {
    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing { progress: usize },
    Succeeded,
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    #[serde(flatten)]
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub receipt: String,
    pub body: String,
}

/// Flat key/value object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Overwrites any existing object
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
}

#[async_trait]
pub trait JobStatusStore: Send + Sync {
    async fn update(&self, job_id: &str, status: JobStatus) -> Result<()>;
}

/// At-least-once job queue; unacknowledged messages may be redelivered.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, body: String) -> Result<()>;

    async fn receive(&self) -> Result<Option<QueueMessage>>;

    async fn ack(&self, receipt: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.lock().insert(key.into(), data.into());
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("object", key))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.lock().insert(key.to_string(), data);
        Ok(())
    }
}

/// Objects as files under a root directory; keys use `/` separators.
pub struct LocalDirObjectStore {
    root: PathBuf,
}

impl LocalDirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(Error::InvalidInput(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalDirObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found("object", key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        Ok(())
    }
}

/// Keeps every status transition per job
#[derive(Default)]
pub struct InMemoryStatusStore {
    history: Mutex<HashMap<String, Vec<JobRecord>>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, job_id: &str) -> Vec<JobStatus> {
        self.history
            .lock()
            .get(job_id)
            .map(|records| records.iter().map(|r| r.status.clone()).collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, job_id: &str) -> Option<JobRecord> {
        self.history.lock().get(job_id).and_then(|r| r.last().cloned())
    }
}

#[async_trait]
impl JobStatusStore for InMemoryStatusStore {
    async fn update(&self, job_id: &str, status: JobStatus) -> Result<()> {
        let record = JobRecord {
            job_id: job_id.to_string(),
            status,
            updated_at: Utc::now(),
        };
        self.history
            .lock()
            .entry(job_id.to_string())
            .or_default()
            .push(record);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryQueue {
    pending: Mutex<VecDeque<QueueMessage>>,
    inflight: Mutex<HashMap<String, QueueMessage>>,
    next_receipt: AtomicU64,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Received but not yet acknowledged
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Make every unacknowledged message visible again
    pub fn requeue_inflight(&self) -> usize {
        let drained: Vec<QueueMessage> = self.inflight.lock().drain().map(|(_, m)| m).collect();
        let count = drained.len();
        self.pending.lock().extend(drained);
        count
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn send(&self, body: String) -> Result<()> {
        let receipt = format!("r{}", self.next_receipt.fetch_add(1, Ordering::Relaxed) + 1);
        self.pending.lock().push_back(QueueMessage { receipt, body });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<QueueMessage>> {
        let next = self.pending.lock().pop_front();
        if let Some(message) = &next {
            self.inflight
                .lock()
                .insert(message.receipt.clone(), message.clone());
        }
        Ok(next)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        self.inflight
            .lock()
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("receipt", receipt))
    }
}

/// Record the job as queued and put it on the queue
pub async fn submit_job(queue: &dyn JobQueue, status: &dyn JobStatusStore, spec: &JobSpec) -> Result<()> {
    status.update(&spec.job_id, JobStatus::Queued).await?;
    queue.send(serde_json::to_string(spec)?).await
}

fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

pub struct Worker {
    service: MaskworkService,
    inputs: Arc<dyn ObjectStore>,
    outputs: Arc<dyn ObjectStore>,
    status: Arc<dyn JobStatusStore>,
    models: Option<Arc<dyn ObjectStore>>,
    model_key: String,
    idle_backoff: Duration,
}

impl Worker {
    pub fn new(
        service: MaskworkService,
        inputs: Arc<dyn ObjectStore>,
        outputs: Arc<dyn ObjectStore>,
        status: Arc<dyn JobStatusStore>,
    ) -> Self {
        Self {
            service,
            inputs,
            outputs,
            status,
            models: None,
            model_key: DEFAULT_MODEL_KEY.to_string(),
            idle_backoff: Duration::from_secs(2),
        }
    }

    /// Download the checkpoint from `store` when it is missing locally
    pub fn with_model_store(mut self, store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        self.models = Some(store);
        self.model_key = key.into();
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Make sure a checkpoint resolves, fetching it into the configured
    /// checkpoint path (or the default one) if nothing does.
    pub async fn ensure_checkpoint(&self) -> Result<PathBuf> {
        let tried = match self.service.models().resolve() {
            CheckpointResolution::Found(path) => return Ok(path),
            CheckpointResolution::Missing(tried) => tried,
        };
        let Some(store) = &self.models else {
            return Err(Error::ResourceUnavailable(format!(
                "no checkpoint found (tried {:?}) and no model store configured",
                tried
            )));
        };

        let model_config = &self.service.config().model;
        let target = model_config
            .checkpoint
            .clone()
            .unwrap_or_else(|| model_config.default_checkpoint.clone());
        info!("Downloading checkpoint '{}' to {}", self.model_key, target.display());
        let data = store.get(&self.model_key).await.map_err(|e| {
            Error::ResourceUnavailable(format!("checkpoint download failed: {}", e))
        })?;
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data).await?;
        Ok(target)
    }

    async fn report(&self, job_id: &str, status: JobStatus) -> Result<()> {
        debug!("Job {} -> {:?}", job_id, status);
        self.status.update(job_id, status).await
    }

    /// Run one job to a terminal status and record it.
    ///
    /// Job-level problems become `Failed`; only status-store errors are
    /// returned as `Err`.
    pub async fn handle_job(&self, spec: &JobSpec) -> Result<JobStatus> {
        info!("Job {} started ({} -> {})", spec.job_id, spec.dataset_prefix, spec.output_prefix);
        let terminal = match self.run_job(spec).await {
            Ok(()) => {
                metrics::counter!("maskwork_jobs_total", "outcome" => "succeeded").increment(1);
                JobStatus::Succeeded
            }
            Err(reason) => {
                warn!("Job {} failed: {}", spec.job_id, reason);
                metrics::counter!("maskwork_jobs_total", "outcome" => "failed").increment(1);
                JobStatus::Failed { reason }
            }
        };
        self.report(&spec.job_id, terminal.clone()).await?;
        Ok(terminal)
    }

    async fn run_job(&self, spec: &JobSpec) -> std::result::Result<(), String> {
        let keys: Vec<String> = self
            .inputs
            .list(&spec.dataset_prefix)
            .await
            .map_err(|e| e.to_string())?
            .into_iter()
            .filter(|k| self.service.config().dataset.accepts(k))
            .collect();
        if keys.is_empty() {
            return Err("no images".to_string());
        }

        let mut files = Vec::with_capacity(keys.len());
        for key in &keys {
            let data = self.inputs.get(key).await.map_err(|e| e.to_string())?;
            files.push(IngestFile::new(basename(key), data.to_vec()));
        }
        let dataset = self
            .service
            .init_dataset(files, Vec::new())
            .await
            .map_err(|e| format!("init {}", e))?;
        let dataset_id = dataset.dataset_id;

        let result = self.stream_templates(spec, &dataset_id).await;
        if let Err(e) = self.service.delete_dataset(dataset_id.clone()).await {
            debug!("Dataset {} cleanup failed: {}", dataset_id, e);
        }
        result
    }

    async fn stream_templates(
        &self,
        spec: &JobSpec,
        dataset_id: &DatasetId,
    ) -> std::result::Result<(), String> {
        let mut template_ids: Vec<TemplateId> = Vec::new();
        let mut edits = HashMap::new();
        for job_template in &spec.templates {
            let saved = self
                .service
                .save_template(SaveTemplateRequest {
                    dataset_id: dataset_id.clone(),
                    name: job_template.name.clone(),
                    class: job_template.class.clone(),
                    points: job_template.points.clone(),
                    image_filename: job_template.image_filename.clone(),
                })
                .await;
            match saved {
                Ok(template) => {
                    edits.insert(template.id.clone(), job_template.edits.unwrap_or(spec.edits));
                    template_ids.push(template.id);
                }
                Err(e) => warn!("Job {} skipped template {:?}: {}", spec.job_id, job_template.name, e),
            }
        }

        let mut stream = self
            .service
            .apply_stream(StreamRequest {
                dataset_id: dataset_id.clone(),
                template_ids: Some(template_ids),
                edits,
                export_mask: false,
            })
            .await
            .map_err(|e| e.to_string())?;
        self.report(&spec.job_id, JobStatus::Processing { progress: 0 })
            .await
            .map_err(|e| e.to_string())?;

        let mut outcome = StreamOutcome::default();
        while let Some(event) = stream.next().await {
            outcome.observe(&event);
            match &event {
                BatchEvent::Item { filename, .. } => {
                    let data = match event.variant_bytes() {
                        Some(decoded) => decoded.map_err(|e| e.to_string())?,
                        None => continue,
                    };
                    let key = format!("{}{}", spec.output_prefix, filename);
                    self.outputs
                        .put(&key, Bytes::from(data))
                        .await
                        .map_err(|e| format!("upload {}: {}", key, e))?;
                    self.report(&spec.job_id, JobStatus::Processing { progress: outcome.items })
                        .await
                        .map_err(|e| e.to_string())?;
                }
                BatchEvent::Error { filename, error, .. } => {
                    warn!("Job {} could not process {}: {}", spec.job_id, filename, error);
                }
                BatchEvent::Done { .. } => break,
            }
        }

        if !outcome.completed {
            return Err("stream ended before completion".to_string());
        }
        info!(
            "Job {} uploaded {} images ({} failed)",
            spec.job_id, outcome.items, outcome.errors
        );
        Ok(())
    }

    /// Receive and handle at most one message. Returns whether one was found.
    ///
    /// Handled messages are acknowledged; a body that does not parse is left
    /// unacknowledged for the queue's redelivery policy.
    pub async fn poll_once(&self, queue: &dyn JobQueue) -> Result<bool> {
        let Some(message) = queue.receive().await? else {
            return Ok(false);
        };
        let spec = match JobSpec::from_json(&message.body) {
            Ok(spec) => spec,
            Err(e) => {
                error!("Rejected job message {}: {}", message.receipt, e);
                return Ok(true);
            }
        };
        self.handle_job(&spec).await?;
        queue.ack(&message.receipt).await?;
        Ok(true)
    }

    /// Poll until `shutdown` resolves, backing off while the queue is empty.
    pub async fn run<F>(&self, queue: &dyn JobQueue, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.ensure_checkpoint().await?;
        if let Err(e) = self.service.warm_up().await {
            warn!("Warm-up failed: {}", e);
        }
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Worker stopping");
                    return Ok(());
                }
                polled = self.poll_once(queue) => {
                    match polled {
                        Ok(true) => {}
                        Ok(false) => tokio::time::sleep(self.idle_backoff).await,
                        Err(e) => {
                            error!("Job handling failed: {}", e);
                            tokio::time::sleep(self.idle_backoff).await;
                        }
                    }
                }
            }
        }
    }
}
