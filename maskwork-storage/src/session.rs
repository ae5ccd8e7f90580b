//! Interactive single-image sessions

use chrono::{DateTime, Utc};
use maskwork_core::mask;
use maskwork_core::{
    Component, ComponentId, ComponentInfo, Error, Mask, PointPrompt, Result, SessionId, SourceImage,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

struct SessionState {
    image: Arc<SourceImage>,
    points: Vec<PointPrompt>,
    components: BTreeMap<ComponentId, Component>,
    next_component: u64,
    model_id: Option<String>,
    created_at: DateTime<Utc>,
}

/// Copy of a session's state taken under the lock
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub image: Arc<SourceImage>,
    pub points: Vec<PointPrompt>,
    pub model_id: Option<String>,
    pub component_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, SessionState>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `image_bytes` and open a session around it
    pub fn init(&self, image_bytes: &[u8]) -> Result<(SessionId, Arc<SourceImage>)> {
        let image = SourceImage::decode(image_bytes)?;
        let (width, height) = image.dimensions();
        let (id, image) = self.insert(image);
        info!("Session {} created for {}x{} image", id, width, height);
        Ok((id, image))
    }

    pub fn insert(&self, image: SourceImage) -> (SessionId, Arc<SourceImage>) {
        let id = SessionId::generate();
        let image = Arc::new(image);
        let state = SessionState {
            image: image.clone(),
            points: Vec::new(),
            components: BTreeMap::new(),
            next_component: 1,
            model_id: None,
            created_at: Utc::now(),
        };
        self.sessions.lock().insert(id.clone(), state);
        (id, image)
    }

    fn with_session<T>(&self, id: &SessionId, f: impl FnOnce(&mut SessionState) -> Result<T>) -> Result<T> {
        let mut sessions = self.sessions.lock();
        let state = sessions
            .get_mut(id)
            .ok_or_else(|| Error::not_found("session", id.as_str()))?;
        f(state)
    }

    pub fn image(&self, id: &SessionId) -> Result<Arc<SourceImage>> {
        self.with_session(id, |s| Ok(s.image.clone()))
    }

    /// Append to (or replace) the prompt list; returns the resulting list.
    ///
    /// Any invalid point rejects the whole call and leaves the session as it was.
    pub fn add_points(&self, id: &SessionId, points: &[PointPrompt], accumulate: bool) -> Result<Vec<PointPrompt>> {
        if let Some(bad) = points.iter().find(|p| !p.is_valid()) {
            return Err(Error::InvalidInput(format!(
                "point ({}, {}) is outside [0, 1]",
                bad.x_norm, bad.y_norm
            )));
        }
        self.with_session(id, |s| {
            if !accumulate {
                s.points.clear();
            }
            s.points.extend_from_slice(points);
            Ok(s.points.clone())
        })
    }

    pub fn points(&self, id: &SessionId) -> Result<Vec<PointPrompt>> {
        self.with_session(id, |s| Ok(s.points.clone()))
    }

    pub fn set_model_id(&self, id: &SessionId, model_id: &str) -> Result<()> {
        self.with_session(id, |s| {
            s.model_id = Some(model_id.to_string());
            Ok(())
        })
    }

    pub fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot> {
        self.with_session(id, |s| {
            Ok(SessionSnapshot {
                id: id.clone(),
                image: s.image.clone(),
                points: s.points.clone(),
                model_id: s.model_id.clone(),
                component_count: s.components.len(),
                created_at: s.created_at,
            })
        })
    }

    /// Save `mask` as the session's next component.
    ///
    /// Ids start at 1 and are never reused, even after deletion. An empty or
    /// absent name becomes `component_{id}`.
    pub fn save_component(
        &self,
        id: &SessionId,
        mask: Mask,
        score: f32,
        name: Option<String>,
    ) -> Result<ComponentInfo> {
        let expected = self.image(id)?.dimensions();
        if mask.dimensions() != expected {
            return Err(Error::InvalidInput(format!(
                "mask is {}x{} but the session image is {}x{}",
                mask.width(),
                mask.height(),
                expected.0,
                expected.1
            )));
        }
        let (bbox, area) = mask.bbox_and_area();
        let mask = Arc::new(mask);
        let name = name.filter(|n| !n.trim().is_empty());

        let info = self.with_session(id, |s| {
            let component_id = ComponentId(s.next_component);
            s.next_component += 1;
            let component = Component {
                id: component_id,
                name: name.unwrap_or_else(|| format!("component_{}", component_id)),
                bbox,
                area,
                score,
                mask,
            };
            let info = component.info();
            s.components.insert(component_id, component);
            Ok(info)
        })?;
        debug!("Session {} saved component {} (area {})", id, info.id, info.area);
        Ok(info)
    }

    /// Public fields of every live component, ascending by id
    pub fn list_components(&self, id: &SessionId) -> Result<Vec<ComponentInfo>> {
        self.with_session(id, |s| Ok(s.components.values().map(Component::info).collect()))
    }

    pub fn component(&self, id: &SessionId, component_id: ComponentId) -> Result<Component> {
        self.with_session(id, |s| {
            s.components
                .get(&component_id)
                .cloned()
                .ok_or_else(|| Error::not_found("component", component_id.to_string()))
        })
    }

    /// Masks for the requested ids in request order; unknown ids are skipped.
    pub fn component_masks(&self, id: &SessionId, ids: &[ComponentId]) -> Result<Vec<(ComponentId, Arc<Mask>)>> {
        self.with_session(id, |s| {
            Ok(ids
                .iter()
                .filter_map(|cid| s.components.get(cid).map(|c| (*cid, c.mask.clone())))
                .collect())
        })
    }

    /// PNG of one component's mask
    pub fn export_component_mask(&self, id: &SessionId, component_id: ComponentId) -> Result<Vec<u8>> {
        let component = self.component(id, component_id)?;
        mask::encode(&component.mask)
    }

    pub fn delete_component(&self, id: &SessionId, component_id: ComponentId) -> Result<()> {
        self.with_session(id, |s| {
            s.components
                .remove(&component_id)
                .map(|_| ())
                .ok_or_else(|| Error::not_found("component", component_id.to_string()))
        })
    }

    /// Drop a session and everything it owns; false if it did not exist
    pub fn evict(&self, id: &SessionId) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            info!("Session {} evicted", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use maskwork_core::ErrorKind;

    fn store_with_image() -> (SessionStore, SessionId) {
        let store = SessionStore::new();
        let (id, _) = store.insert(SourceImage::from_pixels(RgbImage::from_pixel(100, 100, Rgb([128, 128, 128]))));
        (store, id)
    }

    #[test]
    fn test_init_rejects_bad_bytes() {
        let store = SessionStore::new();
        assert_eq!(store.init(b"nope").unwrap_err().kind(), ErrorKind::InvalidInput);
        assert!(store.is_empty());
    }

    #[test]
    fn test_points_accumulate_and_replace() {
        let (store, id) = store_with_image();
        store.add_points(&id, &[PointPrompt::positive(0.1, 0.1)], true).unwrap();
        let pts = store.add_points(&id, &[PointPrompt::negative(0.2, 0.2)], true).unwrap();
        assert_eq!(pts.len(), 2);
        assert!(!pts[1].positive);

        let pts = store.add_points(&id, &[PointPrompt::positive(0.9, 0.9)], false).unwrap();
        assert_eq!(pts, vec![PointPrompt::positive(0.9, 0.9)]);
    }

    #[test]
    fn test_invalid_point_leaves_state() {
        let (store, id) = store_with_image();
        store.add_points(&id, &[PointPrompt::positive(0.1, 0.1)], true).unwrap();
        let err = store
            .add_points(&id, &[PointPrompt::positive(0.5, 0.5), PointPrompt::positive(2.0, 0.5)], false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(store.points(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_component_ids_monotonic_after_delete() {
        let (store, id) = store_with_image();
        let a = store.save_component(&id, Mask::from_rect(100, 100, 10, 10, 20, 20), 0.9, None).unwrap();
        let b = store.save_component(&id, Mask::from_rect(100, 100, 0, 0, 1, 1), 0.5, Some("b".into())).unwrap();
        assert_eq!((a.id, b.id), (ComponentId(1), ComponentId(2)));
        assert_eq!(a.name, "component_1");
        assert_eq!(a.area, 121);
        assert_eq!(a.bbox.0, [10, 10, 20, 20]);

        store.delete_component(&id, ComponentId(2)).unwrap();
        let c = store.save_component(&id, Mask::full(100, 100), 0.1, Some("  ".into())).unwrap();
        assert_eq!(c.id, ComponentId(3));
        assert_eq!(c.name, "component_3");

        let listed: Vec<u64> = store.list_components(&id).unwrap().iter().map(|c| c.id.0).collect();
        assert_eq!(listed, vec![1, 3]);
    }

    #[test]
    fn test_component_dimension_mismatch() {
        let (store, id) = store_with_image();
        let err = store.save_component(&id, Mask::full(10, 10), 1.0, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(store.list_components(&id).unwrap().is_empty());
    }

    #[test]
    fn test_export_and_masks_lookup() {
        let (store, id) = store_with_image();
        let saved = store.save_component(&id, Mask::from_rect(100, 100, 5, 5, 6, 6), 1.0, None).unwrap();
        let png = store.export_component_mask(&id, saved.id).unwrap();
        assert_eq!(mask::decode(&png).unwrap().area(), 4);

        let masks = store.component_masks(&id, &[ComponentId(7), saved.id]).unwrap();
        assert_eq!(masks.len(), 1);
        assert_eq!(masks[0].0, saved.id);
    }

    #[test]
    fn test_unknown_ids_not_found() {
        let (store, id) = store_with_image();
        let missing = SessionId::from("missing");
        assert_eq!(store.points(&missing).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(store.delete_component(&id, ComponentId(1)).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(store.export_component_mask(&id, ComponentId(1)).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_evict() {
        let (store, id) = store_with_image();
        store.set_model_id(&id, "m").unwrap();
        assert_eq!(store.snapshot(&id).unwrap().model_id.as_deref(), Some("m"));
        assert!(store.evict(&id));
        assert!(!store.evict(&id));
        assert!(store.image(&id).is_err());
    }
}
