use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, Rgb, RgbImage};
use maskwork_core::{mask, ComponentId, DatasetId, EditParams, Error, ErrorKind, ImageId, Mask, MaskworkConfig, PointPrompt};
use maskwork_eye::models::{RegionGrowCheckpoint, RegionGrowLoader, RegionGrowModel};
use maskwork_eye::ModelManager;
use maskwork_server::dto::*;
use maskwork_server::MaskworkService;
use maskwork_storage::{IngestArchive, IngestFile};
use std::sync::Arc;
use tokio_test::block_on;

fn png(w: u32, h: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(w, h, Rgb([90, 120, 150]));
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(img.as_raw(), w, h, ColorType::Rgb8)
        .unwrap();
    out
}

fn service() -> MaskworkService {
    let config = MaskworkConfig::default();
    let model = RegionGrowModel::new("region-grow:edge", RegionGrowCheckpoint::default()).unwrap();
    let models = Arc::new(ModelManager::with_model(
        Arc::new(config.model.clone()),
        Arc::new(RegionGrowLoader),
        Arc::new(model),
    ));
    MaskworkService::from_parts(config, models, None)
}

#[tokio::test]
async fn test_garbage_image_is_invalid_input() {
    let err = service().init_session(b"GIF89a?".to_vec()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_malformed_mask_is_rejected() {
    let svc = service();
    let session = svc.init_session(png(20, 20)).await.unwrap();
    let err = svc
        .save_component(SaveComponentRequest {
            session_id: session.session_id.clone(),
            mask_png: "bm90IGEgcG5n".to_string(),
            score: 0.0,
            name: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMaskFormat(_)));
    assert!(svc.components(session.session_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mask_dimension_mismatch() {
    let svc = service();
    let session = svc.init_session(png(20, 20)).await.unwrap();
    let err = svc
        .save_component(SaveComponentRequest {
            session_id: session.session_id,
            mask_png: mask::encode_base64(&Mask::full(10, 10)).unwrap(),
            score: 0.0,
            name: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_unknown_component_edits_are_skipped() {
    let svc = service();
    let source = png(12, 12);
    let session = svc.init_session(source.clone()).await.unwrap();
    let applied = svc
        .apply(ApplyRequest {
            session_id: session.session_id,
            edits: vec![ComponentEdit { component_id: ComponentId(7), params: EditParams::brightness(0.5) }],
            export_mask: true,
        })
        .await
        .unwrap();
    assert!(applied.applied.is_empty());

    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD.decode(&applied.image_png).unwrap();
    let out = image::load_from_memory(&bytes).unwrap().to_rgb8();
    assert!(out.pixels().all(|p| p.0 == [90, 120, 150]));
    assert!(mask::decode_base64(applied.mask_png.as_deref().unwrap()).unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_component_cannot_be_deleted_twice() {
    let svc = service();
    let session = svc.init_session(png(8, 8)).await.unwrap();
    let info = svc
        .save_component(SaveComponentRequest {
            session_id: session.session_id.clone(),
            mask_png: mask::encode_base64(&Mask::from_rect(8, 8, 1, 1, 2, 2)).unwrap(),
            score: 0.3,
            name: Some("dot".to_string()),
        })
        .await
        .unwrap();
    svc.delete_component(session.session_id.clone(), info.id).await.unwrap();
    let err = svc.delete_component(session.session_id, info.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_replace_points_when_not_accumulating() {
    let svc = service();
    let session = svc.init_session(png(30, 30)).await.unwrap();
    for (point, accumulate) in [
        (PointPrompt::positive(0.2, 0.2), true),
        (PointPrompt::positive(0.4, 0.4), true),
        (PointPrompt::positive(0.6, 0.6), false),
    ] {
        svc.segment(SegmentRequest {
            session_id: session.session_id.clone(),
            points: vec![point],
            accumulate,
            top_k: Some(1),
        })
        .await
        .unwrap();
    }
    let last = svc
        .segment(SegmentRequest {
            session_id: session.session_id,
            points: vec![],
            accumulate: true,
            top_k: None,
        })
        .await
        .unwrap();
    assert_eq!(last.points, vec![PointPrompt::positive(0.6, 0.6)]);
}

#[tokio::test]
async fn test_out_of_range_point_leaves_prompts_unchanged() {
    let svc = service();
    let session = svc.init_session(png(30, 30)).await.unwrap();
    let err = svc
        .segment(SegmentRequest {
            session_id: session.session_id.clone(),
            points: vec![PointPrompt::positive(1.5, 0.5)],
            accumulate: true,
            top_k: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = svc
        .segment(SegmentRequest {
            session_id: session.session_id,
            points: vec![],
            accumulate: true,
            top_k: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_dataset_with_no_images_is_rejected() {
    let svc = service();
    let err = block_on(svc.init_dataset(
        vec![IngestFile::new("notes.png", b"plain text".to_vec())],
        vec![IngestArchive { filename: "empty.zip".to_string(), bytes: Vec::new() }],
    ))
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_template_validation() {
    let svc = service();
    let dataset = block_on(svc.init_dataset(vec![IngestFile::new("a.png", png(10, 10))], Vec::new())).unwrap();

    let no_points = block_on(svc.save_template(SaveTemplateRequest {
        dataset_id: dataset.dataset_id.clone(),
        name: None,
        class: None,
        points: vec![],
        image_filename: None,
    }));
    assert!(matches!(no_points, Err(Error::InvalidInput(_))));

    let outside = block_on(svc.save_template(SaveTemplateRequest {
        dataset_id: dataset.dataset_id.clone(),
        name: None,
        class: None,
        points: vec![PointPrompt::negative(-0.1, 0.5)],
        image_filename: None,
    }));
    assert!(matches!(outside, Err(Error::InvalidInput(_))));

    let saved = block_on(svc.save_template(SaveTemplateRequest {
        dataset_id: dataset.dataset_id.clone(),
        name: Some("   ".to_string()),
        class: Some(" ".to_string()),
        points: vec![PointPrompt::positive(0.5, 0.5)],
        image_filename: None,
    }))
    .unwrap();
    assert_eq!(saved.name, "template");
    assert_eq!(saved.class, None);
    assert_eq!(block_on(svc.list_templates(dataset.dataset_id)).unwrap(), vec![saved]);
}

#[test]
fn test_unknown_ids_are_not_found() {
    let svc = service();
    let dataset = block_on(svc.init_dataset(vec![IngestFile::new("a.png", png(10, 10))], Vec::new())).unwrap();

    let err = block_on(svc.preview_templates(PreviewRequest {
        dataset_id: dataset.dataset_id.clone(),
        image_id: ImageId::from("nope"),
        template_ids: None,
        edits: Default::default(),
        export_mask: false,
    }))
    .unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "image", .. }));

    let err = block_on(svc.list_templates(DatasetId::from("nope"))).unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "dataset", .. }));
}
