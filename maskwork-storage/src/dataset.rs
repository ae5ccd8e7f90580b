//! Datasets of images plus their class-tagged point templates

use crate::repository::{DatasetRecord, DatasetRepository, ImageRecord, TemplateRecord};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use image::codecs::png::PngEncoder;
use image::{imageops, ColorType, ImageEncoder};
use maskwork_core::config::DatasetConfig;
use maskwork_core::{
    infer_class_from_filename, DatasetId, Error, ImageId, PointPrompt, Result, SourceImage, Template,
    TemplateId,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on the read buffer reserved up front for one archive entry
const MAX_ENTRY_PREALLOC: u64 = 64 << 20;

/// One uploaded image file
#[derive(Debug, Clone)]
pub struct IngestFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Explicit class; when absent it is inferred from the filename
    pub class: Option<String>,
}

impl IngestFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { filename: filename.into(), bytes, class: None }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }
}

/// A zip archive of images; non-image entries are ignored
#[derive(Debug, Clone)]
pub struct IngestArchive {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// An ingested dataset member
#[derive(Debug)]
pub struct DatasetImage {
    pub id: ImageId,
    pub filename: String,
    pub class: Option<String>,
    pub thumbnail_png: Vec<u8>,
    pub image: Arc<SourceImage>,
}

impl DatasetImage {
    pub fn index_entry(&self) -> ImageIndexEntry {
        ImageIndexEntry {
            id: self.id.clone(),
            filename: self.filename.clone(),
            width: self.image.width(),
            height: self.image.height(),
            class: self.class.clone(),
            thumbnail: BASE64.encode(&self.thumbnail_png),
        }
    }
}

/// Public listing of a dataset image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageIndexEntry {
    pub id: ImageId,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub class: Option<String>,
    /// Base64 PNG, longest edge at most the configured thumbnail size
    pub thumbnail: String,
}

struct DatasetState {
    created_at: DateTime<Utc>,
    images: Vec<Arc<DatasetImage>>,
    /// Insertion order is application order
    templates: Vec<Template>,
}

pub struct DatasetStore {
    config: DatasetConfig,
    datasets: Mutex<HashMap<DatasetId, DatasetState>>,
    repository: Option<Arc<dyn DatasetRepository>>,
}

impl DatasetStore {
    pub fn new(config: DatasetConfig) -> Self {
        Self {
            config,
            datasets: Mutex::new(HashMap::new()),
            repository: None,
        }
    }

    /// Store that writes every dataset and template through to `repository`
    pub fn with_repository(config: DatasetConfig, repository: Arc<dyn DatasetRepository>) -> Self {
        Self {
            repository: Some(repository),
            ..Self::new(config)
        }
    }

    /// Ingest files and archives into a new dataset.
    ///
    /// Undecodable entries are skipped; the call fails only when no image at
    /// all could be decoded.
    pub fn init_dataset(
        &self,
        files: Vec<IngestFile>,
        archives: Vec<IngestArchive>,
    ) -> Result<(DatasetId, Vec<ImageIndexEntry>)> {
        let mut candidates = files;
        for archive in &archives {
            candidates.extend(self.unpack_archive(archive));
        }

        let images: Vec<Arc<DatasetImage>> = candidates
            .into_iter()
            .filter_map(|file| match self.ingest(file) {
                Ok(image) => Some(Arc::new(image)),
                Err((filename, e)) => {
                    warn!("Skipping {}: {}", filename, e);
                    None
                }
            })
            .collect();

        if images.is_empty() {
            return Err(Error::InvalidInput("no decodable images were provided".to_string()));
        }

        let id = DatasetId::generate();
        let created_at = Utc::now();
        let index: Vec<ImageIndexEntry> = images.iter().map(|i| i.index_entry()).collect();

        if let Some(repo) = &self.repository {
            let record = DatasetRecord { id: id.clone(), created_at };
            let rows: Vec<ImageRecord> = index
                .iter()
                .map(|entry| ImageRecord {
                    id: entry.id.clone(),
                    dataset_id: id.clone(),
                    filename: entry.filename.clone(),
                    storage_path: format!("datasets/{}/{}", id, entry.filename),
                    width: entry.width,
                    height: entry.height,
                    thumbnail: entry.thumbnail.clone(),
                    class: entry.class.clone(),
                })
                .collect();
            repo.save_dataset(&record, &rows)?;
        }

        self.datasets.lock().insert(
            id.clone(),
            DatasetState {
                created_at,
                images,
                templates: Vec::new(),
            },
        );
        info!("Dataset {} created with {} images", id, index.len());
        Ok((id, index))
    }

    fn ingest(&self, file: IngestFile) -> std::result::Result<DatasetImage, (String, Error)> {
        let image = SourceImage::decode(&file.bytes).map_err(|e| (file.filename.clone(), e))?;
        let thumbnail_png = self.thumbnail(&image).map_err(|e| (file.filename.clone(), e))?;
        let class = file
            .class
            .filter(|c| !c.trim().is_empty())
            .or_else(|| infer_class_from_filename(&file.filename));
        Ok(DatasetImage {
            id: ImageId::generate(),
            filename: file.filename,
            class,
            thumbnail_png,
            image: Arc::new(image),
        })
    }

    fn thumbnail(&self, image: &SourceImage) -> Result<Vec<u8>> {
        let (w, h) = image.dimensions();
        let edge = self.config.thumbnail_size;
        let (tw, th) = if w.max(h) <= edge {
            (w, h)
        } else if w >= h {
            (edge, ((h as u64 * edge as u64) / w as u64).max(1) as u32)
        } else {
            (((w as u64 * edge as u64) / h as u64).max(1) as u32, edge)
        };
        let small = imageops::thumbnail(image.pixels(), tw, th);
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(small.as_raw(), tw, th, ColorType::Rgb8)
            .map_err(|e| Error::ProcessingFailure(format!("thumbnail encoding failed: {}", e)))?;
        Ok(out)
    }

    fn unpack_archive(&self, archive: &IngestArchive) -> Vec<IngestFile> {
        let mut zip = match zip::ZipArchive::new(Cursor::new(archive.bytes.as_slice())) {
            Ok(zip) => zip,
            Err(e) => {
                warn!("Ignoring unreadable archive {}: {}", archive.filename, e);
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        for i in 0..zip.len() {
            let mut entry = match zip.by_index(i) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Archive {} entry {} unreadable: {}", archive.filename, i, e);
                    continue;
                }
            };
            if entry.is_dir() {
                continue;
            }
            let Some(filename) = Path::new(entry.name())
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
            else {
                continue;
            };
            if filename.starts_with('.') || entry.name().starts_with("__MACOSX") || !self.config.accepts(&filename) {
                debug!("Archive {} skipping {}", archive.filename, entry.name());
                continue;
            }
            // the header size is untrusted
            let mut bytes = Vec::with_capacity(entry.size().min(MAX_ENTRY_PREALLOC) as usize);
            if let Err(e) = entry.read_to_end(&mut bytes) {
                warn!("Archive {} entry {} unreadable: {}", archive.filename, filename, e);
                continue;
            }
            files.push(IngestFile::new(filename, bytes));
        }
        files
    }

    fn with_dataset<T>(&self, id: &DatasetId, f: impl FnOnce(&mut DatasetState) -> Result<T>) -> Result<T> {
        let mut datasets = self.datasets.lock();
        let state = datasets
            .get_mut(id)
            .ok_or_else(|| Error::not_found("dataset", id.as_str()))?;
        f(state)
    }

    /// Save a template; at least one point is required and all must be valid.
    pub fn save_template(
        &self,
        dataset_id: &DatasetId,
        name: &str,
        class: Option<String>,
        points: Vec<PointPrompt>,
        source_filename: Option<String>,
    ) -> Result<Template> {
        if points.is_empty() {
            return Err(Error::InvalidInput("a template needs at least one point".to_string()));
        }
        if points.iter().any(|p| !p.is_valid()) {
            return Err(Error::InvalidInput("template points must lie within [0, 1]".to_string()));
        }
        let template = Template {
            id: TemplateId::generate(),
            name: if name.trim().is_empty() { "template".to_string() } else { name.to_string() },
            class: class.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            points,
            source_filename,
            created_at: Utc::now(),
        };

        // existence check first so nothing is persisted for an unknown dataset
        self.with_dataset(dataset_id, |_| Ok(()))?;
        if let Some(repo) = &self.repository {
            repo.save_template(&TemplateRecord::from_template(dataset_id, &template)?)?;
        }
        self.with_dataset(dataset_id, |s| {
            s.templates.push(template.clone());
            Ok(())
        })?;
        info!("Dataset {} saved template {} ({})", dataset_id, template.id, template.name);
        Ok(template)
    }

    /// Templates in insertion order
    pub fn list_templates(&self, dataset_id: &DatasetId) -> Result<Vec<Template>> {
        self.with_dataset(dataset_id, |s| Ok(s.templates.clone()))
    }
    /// Saved templates in insertion order, restricted to `ids` when given
    /// The named templates in request order, or all of them when `ids` is `None`
    pub fn select_templates(&self, dataset_id: &DatasetId, ids: Option<&[TemplateId]>) -> Result<Vec<Template>> {
        self.with_dataset(dataset_id, |s| match ids {
            None => Ok(s.templates.clone()),
            Some(ids) => {
                if let Some(unknown) = ids.iter().find(|id| !s.templates.iter().any(|t| &t.id == *id)) {
                    return Err(Error::not_found("template", unknown.as_str()));
                }
                // insertion order, each template at most once
                Ok(s.templates.iter().filter(|t| ids.contains(&t.id)).cloned().collect())
            }
        })
    }

    pub fn images(&self, dataset_id: &DatasetId) -> Result<Vec<Arc<DatasetImage>>> {
        self.with_dataset(dataset_id, |s| Ok(s.images.clone()))
    }

    pub fn image(&self, dataset_id: &DatasetId, image_id: &ImageId) -> Result<Arc<DatasetImage>> {
        self.with_dataset(dataset_id, |s| {
            s.images
                .iter()
                .find(|i| &i.id == image_id)
                .cloned()
                .ok_or_else(|| Error::not_found("image", image_id.as_str()))
        })
    }

    pub fn index(&self, dataset_id: &DatasetId) -> Result<Vec<ImageIndexEntry>> {
        let images = self.images(dataset_id)?;
        Ok(images.iter().map(|i| i.index_entry()).collect())
    }

    pub fn created_at(&self, dataset_id: &DatasetId) -> Result<DateTime<Utc>> {
        self.with_dataset(dataset_id, |s| Ok(s.created_at))
    }

    /// Remove a dataset with its images and templates
    pub fn delete_dataset(&self, dataset_id: &DatasetId) -> Result<()> {
        let removed = self.datasets.lock().remove(dataset_id).is_some();
        if let Some(repo) = &self.repository {
            repo.delete_dataset(dataset_id)?;
        }
        if !removed {
            return Err(Error::not_found("dataset", dataset_id.as_str()));
        }
        info!("Dataset {} deleted", dataset_id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.datasets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use image::{Rgb, RgbImage};
    use maskwork_core::ErrorKind;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb([10, 20, 30]));
        let mut out = Vec::new();
        PngEncoder::new(&mut out).write_image(img.as_raw(), w, h, ColorType::Rgb8).unwrap();
        out
    }

    fn zip_of(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_init_from_files_and_archive() {
        let store = DatasetStore::new(DatasetConfig::default());
        let archive = zip_of(&[
            ("imgs/sample_pass.png", png(300, 150)),
            ("imgs/readme.txt", b"hello".to_vec()),
            ("__MACOSX/imgs/._sample_pass.png", b"junk".to_vec()),
        ]);
        let (id, index) = store
            .init_dataset(
                vec![IngestFile::new("sample_fail.png", png(20, 10))],
                vec![IngestArchive { filename: "set.zip".into(), bytes: archive }],
            )
            .unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index[0].class.as_deref(), Some("fail"));
        assert_eq!(index[1].filename, "sample_pass.png");
        assert_eq!(index[1].class.as_deref(), Some("pass"));
        assert_eq!((index[1].width, index[1].height), (300, 150));

        let thumb = BASE64.decode(&index[1].thumbnail).unwrap();
        let thumb = image::load_from_memory(&thumb).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (128, 64));
        assert_eq!(store.images(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_archive_with_inflated_size_header() {
        let mut archive = zip_of(&[("big.png", png(4, 4))]);
        // claim a 2 GiB uncompressed size in the central directory
        let central = archive
            .windows(4)
            .position(|w| w == [0x50, 0x4b, 0x01, 0x02])
            .unwrap();
        archive[central + 24..central + 28].copy_from_slice(&0x7fff_ffffu32.to_le_bytes());

        let store = DatasetStore::new(DatasetConfig::default());
        let (_, index) = store
            .init_dataset(
                vec![IngestFile::new("loose.png", png(4, 4))],
                vec![IngestArchive { filename: "inflated.zip".into(), bytes: archive }],
            )
            .unwrap();
        assert!(index.iter().any(|e| e.filename == "loose.png"));
        assert!(index.len() <= 2);
    }

    #[test]
    fn test_explicit_class_wins_over_filename() {
        let store = DatasetStore::new(DatasetConfig::default());
        let (_, index) = store
            .init_dataset(vec![IngestFile::new("sample_fail.png", png(4, 4)).with_class("pass")], vec![])
            .unwrap();
        assert_eq!(index[0].class.as_deref(), Some("pass"));
    }

    #[test]
    fn test_zero_images_fails() {
        let store = DatasetStore::new(DatasetConfig::default());
        let err = store
            .init_dataset(
                vec![IngestFile::new("broken.png", b"xx".to_vec())],
                vec![IngestArchive { filename: "bad.zip".into(), bytes: b"not a zip".to_vec() }],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(store.is_empty());
    }

    #[test]
    fn test_templates_in_insertion_order() {
        let store = DatasetStore::new(DatasetConfig::default());
        let (id, _) = store.init_dataset(vec![IngestFile::new("a.png", png(4, 4))], vec![]).unwrap();
        let first = store
            .save_template(&id, "first", Some("pass".into()), vec![PointPrompt::positive(0.5, 0.5)], None)
            .unwrap();
        let second = store
            .save_template(&id, "second", Some(" ".into()), vec![PointPrompt::positive(0.2, 0.2)], None)
            .unwrap();
        assert_eq!(second.class, None);

        let names: Vec<String> = store.list_templates(&id).unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["first", "second"]);

        let picked = store
            .select_templates(&id, Some(&[second.id.clone(), first.id.clone(), second.id.clone()]))
            .unwrap();
        let picked: Vec<&str> = picked.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(picked, vec!["first", "second"]);

        let only_second = store.select_templates(&id, Some(&[second.id.clone()])).unwrap();
        assert_eq!(only_second.len(), 1);
        assert_eq!(only_second[0].id, second.id);
        let missing = store.select_templates(&id, Some(&[TemplateId::from("nope")])).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_template_validation() {
        let store = DatasetStore::new(DatasetConfig::default());
        let (id, _) = store.init_dataset(vec![IngestFile::new("a.png", png(4, 4))], vec![]).unwrap();
        assert_eq!(
            store.save_template(&id, "t", None, vec![], None).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            store
                .save_template(&id, "t", None, vec![PointPrompt::positive(1.5, 0.5)], None)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            store
                .save_template(&DatasetId::from("ghost"), "t", None, vec![PointPrompt::positive(0.5, 0.5)], None)
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_write_through_and_cascade() {
        let repo = Arc::new(InMemoryRepository::new());
        let store = DatasetStore::with_repository(DatasetConfig::default(), repo.clone());
        let (id, _) = store.init_dataset(vec![IngestFile::new("a.png", png(4, 4))], vec![]).unwrap();
        store
            .save_template(&id, "t", None, vec![PointPrompt::positive(0.5, 0.5)], Some("a.png".into()))
            .unwrap();

        let (_, rows) = repo.load_dataset(&id).unwrap().unwrap();
        assert_eq!(rows[0].storage_path, format!("datasets/{}/a.png", id));
        assert_eq!(repo.load_templates(&id).unwrap().len(), 1);

        store.delete_dataset(&id).unwrap();
        assert!(repo.load_dataset(&id).unwrap().is_none());
        assert!(repo.load_templates(&id).unwrap().is_empty());
        assert_eq!(store.delete_dataset(&id).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
