// Configuration for the maskwork engine

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment prefix for layered overrides (`MASKWORK__CACHE__MAX_ENTRIES=500`)
pub const ENV_PREFIX: &str = "MASKWORK";

/// Segmentation checkpoint resolution and loading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Explicit checkpoint path; wins over everything else when it exists
    pub checkpoint: Option<PathBuf>,
    /// Environment variable consulted second
    pub checkpoint_env: String,
    /// Path tried third
    pub default_checkpoint: PathBuf,
    /// Directories scanned last for `<prefix>*.<extension>`
    pub search_dirs: Vec<PathBuf>,
    pub checkpoint_prefix: String,
    pub checkpoint_extension: String,
    /// Model type tag recorded in the model identity
    pub model_type: String,
    /// Load the model at startup instead of on first use
    pub warm_on_start: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            checkpoint_env: "SAM_CHECKPOINT".to_string(),
            default_checkpoint: PathBuf::from("models/sam_vit_b.pth"),
            search_dirs: vec![PathBuf::from("models"), PathBuf::from("py/models")],
            checkpoint_prefix: "sam_vit_b".to_string(),
            checkpoint_extension: "pth".to_string(),
            model_type: "vit_b".to_string(),
            warm_on_start: false,
        }
    }
}

/// Embedding cache bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached embeddings before LRU eviction
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 2000 }
    }
}

/// Edit compositor tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompositorConfig {
    /// Gaussian sigma of the unsharp-mask blur
    pub sharpen_sigma: f32,
    /// Kernel half-width in pixels
    pub sharpen_radius: u32,
    /// Max channel difference (8-bit units) for an image to count as grayscale
    pub grayscale_tolerance: u8,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            sharpen_sigma: 1.0,
            sharpen_radius: 3,
            grayscale_tolerance: 0,
        }
    }
}

/// Dataset ingestion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatasetConfig {
    /// Longest edge of generated thumbnails
    pub thumbnail_size: u32,
    /// Lower-case file extensions accepted from archives and object stores
    pub image_extensions: Vec<String>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 128,
            image_extensions: ["jpg", "jpeg", "png", "bmp", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DatasetConfig {
    pub fn accepts(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                self.image_extensions.iter().any(|allowed| *allowed == e)
            })
            .unwrap_or(false)
    }
}

/// Streaming and interactive segmentation defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// Buffered events between the producer thread and the consumer
    pub channel_capacity: usize,
    /// Number of ranked candidates returned by interactive segmentation
    pub default_top_k: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4,
            default_top_k: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaskworkConfig {
    pub model: ModelConfig,
    pub cache: CacheConfig,
    pub compositor: CompositorConfig,
    pub dataset: DatasetConfig,
    pub batch: BatchConfig,
    pub logging: LoggingConfig,
}

impl MaskworkConfig {
    /// Layer defaults, an optional TOML file and `MASKWORK__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut loaded: MaskworkConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Configuration(e.to_string()))?;
        loaded.apply_legacy_env();
        loaded.validate().map_err(Error::Configuration)?;
        Ok(loaded)
    }

    /// Honour the short environment knobs older deployments set directly.
    fn apply_legacy_env(&mut self) {
        if let Some(max) = std::env::var("EMBED_CACHE_MAX")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.cache.max_entries = max;
        }
        if matches!(std::env::var("WARM_MODEL").as_deref(), Ok("1") | Ok("true")) {
            self.model.warm_on_start = true;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.cache.max_entries == 0 {
            return Err("cache.max_entries must be at least 1".to_string());
        }
        if self.cache.max_entries > 1_000_000 {
            return Err("cache.max_entries too large (max 1000000)".to_string());
        }
        if !self.compositor.sharpen_sigma.is_finite() || self.compositor.sharpen_sigma <= 0.0 {
            return Err("compositor.sharpen_sigma must be positive".to_string());
        }
        if self.compositor.sharpen_radius == 0 || self.compositor.sharpen_radius > 32 {
            return Err("compositor.sharpen_radius must be between 1 and 32".to_string());
        }
        if self.dataset.thumbnail_size == 0 || self.dataset.thumbnail_size > 4096 {
            return Err("dataset.thumbnail_size must be between 1 and 4096".to_string());
        }
        if self.dataset.image_extensions.is_empty() {
            return Err("dataset.image_extensions must not be empty".to_string());
        }
        if self.batch.channel_capacity == 0 {
            return Err("batch.channel_capacity must be at least 1".to_string());
        }
        if self.batch.default_top_k == 0 {
            return Err("batch.default_top_k must be at least 1".to_string());
        }
        if self.model.checkpoint_env.is_empty() {
            return Err("model.checkpoint_env must not be empty".to_string());
        }
        Ok(())
    }
}
