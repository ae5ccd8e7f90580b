//! Persisted dataset layout: one dataset row, many image rows, many template rows.

use chrono::{DateTime, Utc};
use maskwork_core::{DatasetId, Error, ImageId, PointPrompt, Result, Template, TemplateId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: DatasetId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub dataset_id: DatasetId,
    pub filename: String,
    pub storage_path: String,
    pub width: u32,
    pub height: u32,
    /// Base64 PNG
    pub thumbnail: String,
    pub class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: TemplateId,
    pub dataset_id: DatasetId,
    pub name: String,
    pub class: Option<String>,
    /// JSON array of point prompts
    pub points: String,
    pub source_filename: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TemplateRecord {
    pub fn from_template(dataset_id: &DatasetId, template: &Template) -> Result<Self> {
        Ok(Self {
            id: template.id.clone(),
            dataset_id: dataset_id.clone(),
            name: template.name.clone(),
            class: template.class.clone(),
            points: serde_json::to_string(&template.points)?,
            source_filename: template.source_filename.clone(),
            created_at: template.created_at,
        })
    }

    pub fn to_template(&self) -> Result<Template> {
        let points: Vec<PointPrompt> = serde_json::from_str(&self.points)?;
        Ok(Template {
            id: self.id.clone(),
            name: self.name.clone(),
            class: self.class.clone(),
            points,
            source_filename: self.source_filename.clone(),
            created_at: self.created_at,
        })
    }
}

/// Storage of dataset, image and template rows. Deleting a dataset removes
/// its images and templates with it.
pub trait DatasetRepository: Send + Sync {
    fn save_dataset(&self, dataset: &DatasetRecord, images: &[ImageRecord]) -> Result<()>;
    fn save_template(&self, template: &TemplateRecord) -> Result<()>;
    fn load_dataset(&self, id: &DatasetId) -> Result<Option<(DatasetRecord, Vec<ImageRecord>)>>;
    fn load_templates(&self, id: &DatasetId) -> Result<Vec<TemplateRecord>>;
    /// Returns false when the dataset did not exist
    fn delete_dataset(&self, id: &DatasetId) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    datasets: HashMap<DatasetId, DatasetRecord>,
    images: HashMap<DatasetId, Vec<ImageRecord>>,
    templates: HashMap<DatasetId, Vec<TemplateRecord>>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset_count(&self) -> usize {
        self.tables.read().datasets.len()
    }
}

impl DatasetRepository for InMemoryRepository {
    fn save_dataset(&self, dataset: &DatasetRecord, images: &[ImageRecord]) -> Result<()> {
        if let Some(stray) = images.iter().find(|i| i.dataset_id != dataset.id) {
            return Err(Error::InvalidInput(format!(
                "image {} belongs to dataset {}, not {}",
                stray.id, stray.dataset_id, dataset.id
            )));
        }
        let mut tables = self.tables.write();
        tables.datasets.insert(dataset.id.clone(), dataset.clone());
        tables.images.insert(dataset.id.clone(), images.to_vec());
        tables.templates.entry(dataset.id.clone()).or_default();
        debug!("Persisted dataset {} with {} images", dataset.id, images.len());
        Ok(())
    }

    fn save_template(&self, template: &TemplateRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.datasets.contains_key(&template.dataset_id) {
            return Err(Error::not_found("dataset", template.dataset_id.as_str()));
        }
        let rows = tables.templates.entry(template.dataset_id.clone()).or_default();
        match rows.iter_mut().find(|t| t.id == template.id) {
            Some(existing) => *existing = template.clone(),
            None => rows.push(template.clone()),
        }
        Ok(())
    }

    fn load_dataset(&self, id: &DatasetId) -> Result<Option<(DatasetRecord, Vec<ImageRecord>)>> {
        let tables = self.tables.read();
        Ok(tables.datasets.get(id).map(|d| {
            let images = tables.images.get(id).cloned().unwrap_or_default();
            (d.clone(), images)
        }))
    }

    fn load_templates(&self, id: &DatasetId) -> Result<Vec<TemplateRecord>> {
        Ok(self.tables.read().templates.get(id).cloned().unwrap_or_default())
    }

    fn delete_dataset(&self, id: &DatasetId) -> Result<bool> {
        let mut tables = self.tables.write();
        let existed = tables.datasets.remove(id).is_some();
        tables.images.remove(id);
        tables.templates.remove(id);
        Ok(existed)
    }
}
