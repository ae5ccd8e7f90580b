//! Applying a dataset's templates to one image

use crate::cache::CacheKey;
use crate::error::VisionError;
use crate::processing::compositor::Compositor;
use crate::processing::segmentation::SegmentationAdapter;
use image::RgbImage;
use maskwork_core::{EditParams, Mask, SourceImage, Template, TemplateId};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ClassMismatch,
    NoMask,
}

#[derive(Debug, Clone)]
pub struct TemplateOutcome {
    pub image: RgbImage,
    /// Union of every applied template's region
    pub union_mask: Mask,
    pub applied: Vec<TemplateId>,
    pub skipped: Vec<(TemplateId, SkipReason)>,
}

/// Run `templates` in order against `source`.
///
/// Each template that applies to `image_class` is segmented on the original
/// pixels and its edit is composited onto the output of the templates before
/// it. Templates without an entry in `edits` still contribute their region
/// to the union mask. An unavailable model is an error; a template whose
/// prompt yields no mask is skipped.
pub fn apply_templates_for_image(
    adapter: &SegmentationAdapter,
    compositor: &Compositor,
    source: &SourceImage,
    templates: &[Template],
    edits: &HashMap<TemplateId, EditParams>,
    image_class: Option<&str>,
    cache_key: Option<&CacheKey>,
) -> Result<TemplateOutcome, VisionError> {
    let (width, height) = source.dimensions();
    let mut output = source.pixels().clone();
    let mut union_mask = Mask::new(width, height);
    let mut applied = Vec::new();
    let mut skipped = Vec::new();

    for (ordinal, template) in templates.iter().enumerate() {
        if !template.applies_to(image_class) {
            debug!(
                "Template {} ({:?}) does not apply to class {:?}",
                template.id, template.class, image_class
            );
            skipped.push((template.id.clone(), SkipReason::ClassMismatch));
            continue;
        }

        let ranked = match adapter.predict_ranked(source.pixels(), &template.points, cache_key, 1) {
            Ok(ranked) => ranked,
            Err(e @ VisionError::Unavailable(_)) => return Err(e),
            Err(e) => {
                debug!("Template {} produced no mask: {}", template.id, e);
                Vec::new()
            }
        };
        let Some(best) = ranked.into_iter().next() else {
            skipped.push((template.id.clone(), SkipReason::NoMask));
            continue;
        };

        if let Some(edit) = edits.get(&template.id) {
            output = compositor.apply_region(&output, ordinal as u64 + 1, &best.mask, edit)?;
        }
        union_mask.union_with(&best.mask)?;
        applied.push(template.id.clone());
    }

    Ok(TemplateOutcome {
        image: output,
        union_mask,
        applied,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::models::{ModelManager, RegionGrowCheckpoint, RegionGrowLoader, RegionGrowModel};
    use chrono::Utc;
    use image::Rgb;
    use maskwork_core::config::{CompositorConfig, ModelConfig};
    use maskwork_core::PointPrompt;
    use std::sync::Arc;

    fn template(id: &str, class: Option<&str>, x: f32, y: f32) -> Template {
        Template {
            id: TemplateId::from(id),
            name: id.to_string(),
            class: class.map(str::to_string),
            points: vec![PointPrompt::positive(x, y)],
            source_filename: None,
            created_at: Utc::now(),
        }
    }

    fn adapter() -> SegmentationAdapter {
        let model = RegionGrowModel::new("rg", RegionGrowCheckpoint::default()).unwrap();
        let manager = ModelManager::with_model(
            Arc::new(ModelConfig::default()),
            Arc::new(RegionGrowLoader),
            Arc::new(model),
        );
        SegmentationAdapter::new(Arc::new(manager), Arc::new(EmbeddingCache::new(4)))
    }

    /// Left half dark, right half light
    fn two_tone() -> SourceImage {
        SourceImage::from_pixels(RgbImage::from_fn(20, 10, |x, _| {
            if x < 10 {
                Rgb([40, 40, 40])
            } else {
                Rgb([200, 200, 200])
            }
        }))
    }

    #[test]
    fn test_class_mismatch_leaves_image_untouched() {
        let source = two_tone();
        let templates = vec![template("t1", Some("pass"), 0.25, 0.5)];
        let edits = HashMap::from([(TemplateId::from("t1"), EditParams::brightness(0.3))]);
        let compositor = Compositor::new(&CompositorConfig::default());

        let outcome =
            apply_templates_for_image(&adapter(), &compositor, &source, &templates, &edits, Some("fail"), None)
                .unwrap();
        assert_eq!(&outcome.image, source.pixels());
        assert!(outcome.union_mask.is_empty());
        assert_eq!(outcome.skipped, vec![(TemplateId::from("t1"), SkipReason::ClassMismatch)]);
    }

    #[test]
    fn test_templates_compose_and_union() {
        let source = two_tone();
        let templates = vec![
            template("left", None, 0.25, 0.5),
            template("right", Some("pass"), 0.75, 0.5),
        ];
        let edits = HashMap::from([
            (TemplateId::from("left"), EditParams::brightness(0.2)),
            (TemplateId::from("right"), EditParams::brightness(-0.2)),
        ]);
        let compositor = Compositor::new(&CompositorConfig::default());

        let outcome =
            apply_templates_for_image(&adapter(), &compositor, &source, &templates, &edits, Some("pass"), None)
                .unwrap();
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.union_mask.area(), 200);
        assert!(outcome.image.get_pixel(2, 2)[0] > 40);
        assert!(outcome.image.get_pixel(15, 2)[0] < 200);
    }

    #[test]
    fn test_later_templates_see_earlier_output() {
        let source = two_tone();
        let templates = vec![template("a", None, 0.25, 0.5), template("b", None, 0.25, 0.5)];
        let edits = HashMap::from([
            (TemplateId::from("a"), EditParams::brightness(0.2)),
            (TemplateId::from("b"), EditParams::brightness(0.2)),
        ]);
        let compositor = Compositor::new(&CompositorConfig::default());
        let outcome =
            apply_templates_for_image(&adapter(), &compositor, &source, &templates, &edits, None, None).unwrap();
        // 40 + 51 + 51
        assert_eq!(outcome.image.get_pixel(0, 0)[0], 142);
        assert_eq!(outcome.image.get_pixel(19, 0)[0], 200);
    }
}
