//! Model manager: checkpoint resolution and lazy, memoized loading

use crate::error::VisionError;
use crate::models::capability::{ModelLoader, SegmentationModel};
use maskwork_core::config::ModelConfig;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of walking the checkpoint fallback chain
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointResolution {
    Found(PathBuf),
    /// Nothing existed; every candidate that was tried, in order
    Missing(Vec<PathBuf>),
}

/// Resolve a checkpoint: explicit path, then the environment override, then
/// the default path, then the first sorted `<prefix>*.<ext>` in the search dirs.
pub fn resolve_checkpoint(
    config: &ModelConfig,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> CheckpointResolution {
    let mut tried = Vec::new();

    let direct = config
        .checkpoint
        .clone()
        .into_iter()
        .chain(
            env_lookup(&config.checkpoint_env)
                .filter(|v| !v.trim().is_empty())
                .map(|v| PathBuf::from(v.trim())),
        )
        .chain(std::iter::once(config.default_checkpoint.clone()));

    for candidate in direct {
        if candidate.is_file() {
            return CheckpointResolution::Found(candidate);
        }
        tried.push(candidate);
    }

    let suffix = format!(".{}", config.checkpoint_extension);
    for dir in &config.search_dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            tried.push(dir.clone());
            continue;
        };
        let mut matches: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&config.checkpoint_prefix) && n.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();
        matches.sort();
        if let Some(first) = matches.into_iter().next() {
            return CheckpointResolution::Found(first);
        }
        tried.push(dir.clone());
    }

    CheckpointResolution::Missing(tried)
}

/// Snapshot for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub loaded: bool,
    pub model_id: Option<String>,
    pub last_error: Option<String>,
}

/// Holds at most one loaded model for the life of the process.
pub struct ModelManager {
    config: Arc<ModelConfig>,
    loader: Arc<dyn ModelLoader>,
    loaded: RwLock<Option<Arc<dyn SegmentationModel>>>,
    load_lock: Mutex<()>,
    last_error: RwLock<Option<String>>,
}

impl ModelManager {
    pub fn new(config: Arc<ModelConfig>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            config,
            loader,
            loaded: RwLock::new(None),
            load_lock: Mutex::new(()),
            last_error: RwLock::new(None),
        }
    }

    /// Manager around an already constructed model; no checkpoint is consulted.
    pub fn with_model(config: Arc<ModelConfig>, loader: Arc<dyn ModelLoader>, model: Arc<dyn SegmentationModel>) -> Self {
        let manager = Self::new(config, loader);
        *manager.loaded.write() = Some(model);
        manager
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn resolve(&self) -> CheckpointResolution {
        resolve_checkpoint(&self.config, |name| std::env::var(name).ok())
    }

    /// Return the loaded model, loading it on first use.
    ///
    /// A failed load is not memoized, so a checkpoint that appears later
    /// is picked up by the next call.
    pub fn ensure_loaded(&self) -> Result<Arc<dyn SegmentationModel>, VisionError> {
        if let Some(model) = self.loaded.read().as_ref() {
            return Ok(model.clone());
        }

        let _guard = self.load_lock.lock();
        if let Some(model) = self.loaded.read().as_ref() {
            return Ok(model.clone());
        }

        let checkpoint = match self.resolve() {
            CheckpointResolution::Found(path) => path,
            CheckpointResolution::Missing(tried) => {
                let msg = format!(
                    "no segmentation checkpoint found (set {} or place {}*.{} in one of {:?}); tried {:?}",
                    self.config.checkpoint_env,
                    self.config.checkpoint_prefix,
                    self.config.checkpoint_extension,
                    self.config.search_dirs,
                    tried
                );
                warn!("{}", msg);
                *self.last_error.write() = Some(msg.clone());
                return Err(VisionError::Unavailable(msg));
            }
        };

        debug!("Loading segmentation model from {:?}", checkpoint);
        match self.loader.load(&checkpoint, &self.config.model_type) {
            Ok(model) => {
                info!("Segmentation model ready: {}", model.model_id());
                *self.loaded.write() = Some(model.clone());
                *self.last_error.write() = None;
                Ok(model)
            }
            Err(e) => {
                let msg = format!("failed to load checkpoint {:?}: {}", checkpoint, e);
                warn!("{}", msg);
                *self.last_error.write() = Some(msg.clone());
                Err(VisionError::Unavailable(msg))
            }
        }
    }

    /// Model if already loaded; never triggers a load
    pub fn current(&self) -> Option<Arc<dyn SegmentationModel>> {
        self.loaded.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.read().is_some()
    }

    pub fn status(&self) -> ModelStatus {
        let current = self.current();
        ModelStatus {
            loaded: current.is_some(),
            model_id: current.map(|m| m.model_id().to_string()),
            last_error: self.last_error.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::region_grow::RegionGrowLoader;
    use std::collections::HashMap;

    fn config_in(dir: &Path) -> ModelConfig {
        ModelConfig {
            checkpoint: None,
            checkpoint_env: "MASKWORK_TEST_CHECKPOINT".to_string(),
            default_checkpoint: dir.join("missing_default.pth"),
            search_dirs: vec![dir.join("models")],
            ..ModelConfig::default()
        }
    }

    fn write_checkpoint(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, r#"{"tolerances":[0.1]}"#).unwrap();
    }

    #[test]
    fn test_resolution_explicit_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.pth");
        let from_env = dir.path().join("env.pth");
        write_checkpoint(&explicit);
        write_checkpoint(&from_env);

        let mut config = config_in(dir.path());
        config.checkpoint = Some(explicit.clone());
        let env: HashMap<String, String> =
            [(config.checkpoint_env.clone(), from_env.display().to_string())].into();

        let resolved = resolve_checkpoint(&config, |k| env.get(k).cloned());
        assert_eq!(resolved, CheckpointResolution::Found(explicit));
    }

    #[test]
    fn test_resolution_env_then_default() {
        let dir = tempfile::tempdir().unwrap();
        let from_env = dir.path().join("env.pth");
        write_checkpoint(&from_env);
        let config = config_in(dir.path());

        let env: HashMap<String, String> =
            [(config.checkpoint_env.clone(), from_env.display().to_string())].into();
        assert_eq!(
            resolve_checkpoint(&config, |k| env.get(k).cloned()),
            CheckpointResolution::Found(from_env)
        );

        write_checkpoint(&config.default_checkpoint);
        assert_eq!(
            resolve_checkpoint(&config, |_| None),
            CheckpointResolution::Found(config.default_checkpoint.clone())
        );
    }

    #[test]
    fn test_resolution_scans_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        write_checkpoint(&dir.path().join("models/sam_vit_b_02.pth"));
        write_checkpoint(&dir.path().join("models/sam_vit_b_01.pth"));
        write_checkpoint(&dir.path().join("models/other.pth"));

        assert_eq!(
            resolve_checkpoint(&config, |_| None),
            CheckpointResolution::Found(dir.path().join("models/sam_vit_b_01.pth"))
        );
    }

    #[test]
    fn test_resolution_missing_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        match resolve_checkpoint(&config, |_| None) {
            CheckpointResolution::Missing(tried) => {
                assert!(tried.contains(&config.default_checkpoint));
            }
            other => panic!("expected Missing, got {:?}", other),
        }
    }

    #[test]
    fn test_ensure_loaded_unavailable_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config_in(dir.path()));
        let manager = ModelManager::new(config.clone(), Arc::new(RegionGrowLoader));

        assert!(matches!(manager.ensure_loaded(), Err(VisionError::Unavailable(_))));
        assert!(!manager.is_loaded());
        assert!(manager.status().last_error.is_some());

        write_checkpoint(&config.default_checkpoint);
        let model = manager.ensure_loaded().unwrap();
        assert!(model.model_id().starts_with("vit_b:"));
        assert!(manager.status().loaded);
        assert!(manager.status().last_error.is_none());

        let again = manager.ensure_loaded().unwrap();
        assert!(Arc::ptr_eq(&model, &again));
    }

    #[test]
    fn test_corrupt_checkpoint_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        fs::write(&config.default_checkpoint, b"\x00\x01 not json").unwrap();
        let manager = ModelManager::new(Arc::new(config), Arc::new(RegionGrowLoader));
        assert!(matches!(manager.ensure_loaded(), Err(VisionError::Unavailable(_))));
    }
}
