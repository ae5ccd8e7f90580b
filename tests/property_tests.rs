use image::RgbImage;
use maskwork_core::config::CompositorConfig;
use maskwork_core::{mask, EditParams, Mask};
use maskwork_eye::processing::{noise_field, Compositor};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};

fn arb_mask() -> impl Strategy<Value = Mask> {
    (1u32..40, 1u32..40).prop_flat_map(|(w, h)| {
        prop::collection::vec(any::<bool>(), (w * h) as usize)
            .prop_map(move |bits| Mask::from_bits(w, h, bits).unwrap())
    })
}

fn arb_image() -> impl Strategy<Value = RgbImage> {
    (1u32..24, 1u32..24).prop_flat_map(|(w, h)| {
        prop::collection::vec(any::<u8>(), (w * h * 3) as usize)
            .prop_map(move |raw| RgbImage::from_raw(w, h, raw).unwrap())
    })
}

proptest! {
    #[test]
    fn test_mask_round_trip(m in arb_mask()) {
        let encoded = mask::encode(&m).unwrap();
        prop_assert_eq!(mask::decode(&encoded).unwrap(), m);
    }

    #[test]
    fn test_bbox_contains_every_set_pixel(m in arb_mask()) {
        let (bbox, area) = m.bbox_and_area();
        prop_assert_eq!(area, m.area());
        for y in 0..m.height() {
            for x in 0..m.width() {
                if m.get(x, y) {
                    prop_assert!(x >= bbox.xmin() && x <= bbox.xmax());
                    prop_assert!(y >= bbox.ymin() && y <= bbox.ymax());
                }
            }
        }
    }

    #[test]
    fn test_empty_mask_bbox_is_zero(w in 1u32..64, h in 1u32..64) {
        let (bbox, area) = Mask::new(w, h).bbox_and_area();
        prop_assert_eq!(bbox.0, [0, 0, 0, 0]);
        prop_assert_eq!(area, 0);
    }

    #[test]
    fn test_no_edits_is_noop(img in arb_image()) {
        let compositor = Compositor::new(&CompositorConfig::default());
        let full = Mask::full(img.width(), img.height());
        let masks = HashMap::from([(1u64, &full)]);
        let out = compositor.apply(&img, &masks, &BTreeMap::new()).unwrap();
        prop_assert_eq!(out, img);
    }

    #[test]
    fn test_identity_edit_is_noop(img in arb_image(), region in 1u64..50) {
        let compositor = Compositor::new(&CompositorConfig::default());
        let full = Mask::full(img.width(), img.height());
        let identity = EditParams { opacity: Some(1.0), ..EditParams::default() };
        prop_assert!(identity.is_identity());
        let out = compositor.apply_region(&img, region, &full, &identity).unwrap();
        prop_assert_eq!(out, img);
    }

    #[test]
    fn test_untouched_pixels_survive(img in arb_image(), brightness in -1.0f32..1.0) {
        prop_assume!(img.width() > 1);
        let compositor = Compositor::new(&CompositorConfig::default());
        let left = Mask::from_fn(img.width(), img.height(), |x, _| x == 0);
        let out = compositor
            .apply_region(&img, 1, &left, &EditParams::brightness(brightness))
            .unwrap();
        for (x, y, px) in img.enumerate_pixels() {
            if x > 0 {
                prop_assert_eq!(out.get_pixel(x, y), px);
            }
        }
    }

    #[test]
    fn test_noise_is_deterministic(count in 1usize..2000, region in 0u64..1000, std in 0.001f32..0.5) {
        let a = noise_field(count, region, std);
        let b = noise_field(count, region, std);
        prop_assert_eq!(a.len(), count);
        let identical = a.iter().zip(b.iter()).all(|(x, y)| {
            x.iter().zip(y.iter()).all(|(p, q)| p.to_bits() == q.to_bits())
        });
        prop_assert!(identical);
    }
}
