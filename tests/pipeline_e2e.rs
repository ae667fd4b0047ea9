mod common;

use anyhow::bail;
use futures_util::StreamExt;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::*;
use nazr_faces::db::{self, query, writer};
use nazr_faces::error::PipelineError;
use nazr_faces::models::{BatchStatus, Event, FaceCandidate, Stage};
use nazr_faces::pipeline::detect::{FaceDetector, SkinRegionDetector};
use nazr_faces::pipeline::embed::{FaceEmbedder, LumaGridEmbedder, LUMA_GRID_VERSION};
use nazr_faces::pipeline::Models;
use nazr_faces::AppState;

struct BrokenDetector;

impl FaceDetector for BrokenDetector {
    fn model_version(&self) -> &str {
        "broken-detector"
    }

    fn detect(&self, _image: &RgbImage) -> anyhow::Result<Vec<FaceCandidate>> {
        bail!("detector crashed")
    }
}

struct SlowDetector(SkinRegionDetector);

impl FaceDetector for SlowDetector {
    fn model_version(&self) -> &str {
        self.0.model_version()
    }

    fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<FaceCandidate>> {
        std::thread::sleep(Duration::from_millis(100));
        self.0.detect(image)
    }
}

struct BrokenEmbedder;

impl FaceEmbedder for BrokenEmbedder {
    fn model_version(&self) -> &str {
        LUMA_GRID_VERSION
    }

    fn dimension(&self) -> usize {
        256
    }

    fn embed(&self, _crop: &RgbImage) -> anyhow::Result<Vec<f32>> {
        bail!("embedder out of memory")
    }
}

fn models(detector: impl FaceDetector + 'static, embedder: impl FaceEmbedder + 'static) -> Models {
    Models { detector: Arc::new(detector), embedder: Arc::new(embedder) }
}

fn luma() -> LumaGridEmbedder {
    LumaGridEmbedder::new(256).unwrap()
}

fn assert_terminal_invariants(status: &BatchStatus) {
    let c = &status.counts;
    assert_eq!(c.detection.done(), c.images_total, "every image accounted for");
    assert_eq!(c.embedding.done(), c.faces_detected, "every face accounted for");
    assert_eq!(c.indexing.done(), c.embedding.succeeded, "every embedding accounted for");
}

#[tokio::test]
async fn batch_with_a_corrupt_image_completes_with_partial_failure() {
    let tmp = TempDir::new().unwrap();
    let state = start(tmp.path()).await;
    let event = create_event(&state, "Summer Wedding").await;

    let mut blobs: Vec<Vec<u8>> = (0..9).map(face_png).collect();
    blobs.insert(4, truncated_png());
    let handle = state.submit(&photographer(), &event.event_id, uploads(blobs)).await.unwrap();

    let status = wait_terminal(&state, handle.batch_id).await;
    assert_eq!(status.stage, Stage::Complete);
    assert_eq!(status.counts.images_total, 10);
    assert_eq!(status.counts.detection.succeeded, 9);
    assert_eq!(status.counts.detection.failed, 1);
    assert_eq!(status.counts.decode_failures, 1);
    assert_eq!(status.counts.faces_detected, 9);
    assert_eq!(status.counts.indexing.succeeded, 9);
    assert!(status.partial_failure);
    assert_eq!(status.completion, 1.0);
    assert_eq!(
        status.gallery_link.as_deref(),
        Some(format!("{BASE_URL}/gallery/{}/{}", event.event_id, handle.batch_id).as_str())
    );
    assert_terminal_invariants(&status);
    assert_eq!(state.index.event_len(&event.event_id), 9);

    let conn = state.pool.get().unwrap();
    let images = query::batch_images(&conn, handle.batch_id).unwrap();
    assert_eq!(images[4].failure_kind.as_deref(), Some("decode_failure"));
    assert!(images.iter().enumerate().all(|(i, img)| i == 4 || img.face_count == 1));
}

#[tokio::test]
async fn detector_failures_are_recorded_per_image() {
    let tmp = TempDir::new().unwrap();
    let state = AppState::start_with_models(test_config(tmp.path()), models(BrokenDetector, luma())).await.unwrap();
    let event = create_event(&state, "Broken Detector").await;

    let handle = state
        .submit(&photographer(), &event.event_id, uploads(vec![face_png(1), face_png(2), face_png(3)]))
        .await
        .unwrap();
    let status = wait_terminal(&state, handle.batch_id).await;
    assert_eq!(status.stage, Stage::Complete);
    assert_eq!(status.counts.detection.failed, 3);
    assert_eq!(status.counts.decode_failures, 0);
    assert!(status.partial_failure);
    assert_terminal_invariants(&status);

    let conn = state.pool.get().unwrap();
    let images = query::batch_images(&conn, handle.batch_id).unwrap();
    assert!(images.iter().all(|i| i.failure_kind.as_deref() == Some("detection_failure")));
}

#[tokio::test]
async fn embedding_failures_do_not_block_completion() {
    let tmp = TempDir::new().unwrap();
    let state = AppState::start_with_models(test_config(tmp.path()), models(SkinRegionDetector::default(), BrokenEmbedder))
        .await
        .unwrap();
    let event = create_event(&state, "Broken Embedder").await;

    let handle = state
        .submit(&photographer(), &event.event_id, uploads(vec![face_png(1), blank_png()]))
        .await
        .unwrap();
    let status = wait_terminal(&state, handle.batch_id).await;
    assert_eq!(status.stage, Stage::Complete);
    assert_eq!(status.counts.faces_detected, 1);
    assert_eq!(status.counts.embedding.failed, 1);
    assert_eq!(status.counts.indexing.done(), 0);
    assert!(status.partial_failure);
    assert!(state.index.is_empty());
    assert_terminal_invariants(&status);
}

#[tokio::test]
async fn same_image_gives_same_detections_and_embeddings() {
    let tmp = TempDir::new().unwrap();
    let state = start(tmp.path()).await;
    let event = create_event(&state, "Twice").await;

    let mut runs = Vec::new();
    for _ in 0..2 {
        let handle = state.submit(&photographer(), &event.event_id, uploads(vec![face_png(7)])).await.unwrap();
        wait_terminal(&state, handle.batch_id).await;
        let conn = state.pool.get().unwrap();
        let faces = query::batch_faces(&conn, handle.batch_id).unwrap();
        assert_eq!(faces.len(), 1);
        let embedding = query::get_embedding(&conn, faces[0].face_id).unwrap().expect("embedding stored");
        runs.push((faces[0].clone(), embedding));
    }
    let ((a_face, a_emb), (b_face, b_emb)) = (&runs[0], &runs[1]);
    assert_eq!(a_face.bbox, b_face.bbox);
    assert_eq!(a_face.confidence, b_face.confidence);
    assert_eq!(a_emb.vector, b_emb.vector);
    assert_eq!(a_emb.model_version, LUMA_GRID_VERSION);

    let matches = state.query(&event.event_id, a_emb.vector.clone(), 10).await.unwrap();
    assert_eq!(matches.len(), 2);
    assert!(matches.iter().all(|m| m.distance.abs() < 1e-5));
}

#[tokio::test]
async fn subscribers_see_monotonic_progress() {
    let tmp = TempDir::new().unwrap();
    let state = start(tmp.path()).await;
    let event = create_event(&state, "Progress").await;

    let blobs = (0..12).map(face_png).collect();
    let handle = state.submit(&photographer(), &event.event_id, uploads(blobs)).await.unwrap();
    let updates = state.subscribe(handle.batch_id).await.unwrap();
    let snapshots: Vec<BatchStatus> = tokio::time::timeout(Duration::from_secs(30), updates.collect())
        .await
        .expect("stream ends once the batch is terminal");

    assert!(!snapshots.is_empty());
    for pair in snapshots.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        assert!(next.stage >= prev.stage, "{:?} -> {:?}", prev.stage, next.stage);
        assert!(next.completion >= prev.completion);
        assert!(next.counts.detection.done() >= prev.counts.detection.done());
        assert!(next.counts.faces_detected >= prev.counts.faces_detected);
        assert!(next.counts.embedding.done() >= prev.counts.embedding.done());
        assert!(next.counts.indexing.done() >= prev.counts.indexing.done());
    }
    let last = snapshots.last().unwrap();
    assert_eq!(last.stage, Stage::Complete);
    assert!(last.gallery_link.is_some());
    assert!(!last.partial_failure);
}

#[tokio::test]
async fn cancelled_batch_stops_and_stays_cancelled() {
    let tmp = TempDir::new().unwrap();
    let slow = models(SlowDetector(SkinRegionDetector::default()), luma());
    let state = AppState::start_with_models(test_config(tmp.path()), slow).await.unwrap();
    let event = create_event(&state, "Cancelled Shoot").await;

    let blobs = (0..20).map(face_png).collect();
    let handle = state.submit(&photographer(), &event.event_id, uploads(blobs)).await.unwrap();

    let err = state.cancel(&other_photographer(), handle.batch_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Authorization(_)));

    let status = state.cancel(&photographer(), handle.batch_id).await.unwrap();
    assert_eq!(status.stage, Stage::Cancelled);
    assert!(status.cancelled);
    assert!(status.gallery_link.is_none());

    tokio::time::sleep(Duration::from_millis(800)).await;
    let later = state.status(handle.batch_id).await.unwrap();
    assert_eq!(later.stage, Stage::Cancelled);
    assert!(later.gallery_link.is_none());
    assert!(later.counts.detection.done() < 20);

    // Cancelling again is a no-op.
    let again = state.cancel(&admin(), handle.batch_id).await.unwrap();
    assert_eq!(again.stage, Stage::Cancelled);

    let conn = state.pool.get().unwrap();
    let batch = query::get_batch(&conn, handle.batch_id).unwrap().unwrap();
    assert!(batch.cancelled);
    assert_eq!(batch.stage, Stage::Cancelled);
}

#[tokio::test]
async fn cancelling_a_complete_batch_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let state = start(tmp.path()).await;
    let event = create_event(&state, "Already Done").await;
    let handle = state.submit(&photographer(), &event.event_id, uploads(vec![face_png(1)])).await.unwrap();
    wait_terminal(&state, handle.batch_id).await;

    let status = state.cancel(&photographer(), handle.batch_id).await.unwrap();
    assert_eq!(status.stage, Stage::Complete);
    assert!(!status.cancelled);
    assert!(status.gallery_link.is_some());

    let err = state.cancel(&photographer(), 9999).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));
}

#[tokio::test]
async fn unknown_batch_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let state = start(tmp.path()).await;
    assert!(matches!(state.status(424242).await, Err(PipelineError::NotFound { .. })));
    assert!(matches!(state.subscribe(424242).await, Err(PipelineError::NotFound { .. })));
}

#[tokio::test]
async fn open_batches_resume_after_restart() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    std::fs::create_dir_all(tmp.path().join("db")).unwrap();
    let staged_dir = tmp.path().join("left-over");
    std::fs::create_dir_all(&staged_dir).unwrap();

    // A batch staged by a process that died before detection ran.
    let batch_id = {
        let pool = db::create_pool(cfg.db_path(), 2).unwrap();
        let mut conn = pool.get().unwrap();
        let event = Event {
            event_id: "crash-test".into(),
            name: "Crash Test".into(),
            owner_id: "p1".into(),
            created_at: 0,
            share_link: String::new(),
        };
        writer::insert_event(&conn, &event).unwrap();
        let rows: Vec<writer::NewImage> = (0..3)
            .map(|i| {
                let bytes = face_png(i);
                let path = staged_dir.join(format!("{i}.png"));
                std::fs::write(&path, &bytes).unwrap();
                writer::NewImage {
                    path,
                    sha256: format!("{i:064}"),
                    xxh64: i as i64,
                    size_bytes: bytes.len() as i64,
                    format: "png".into(),
                    width: 200,
                    height: 200,
                }
            })
            .collect();
        writer::insert_batch(&mut conn, "crash-test", "p1", 0, &rows).unwrap().0
    };

    let state = AppState::start(cfg.clone()).await.unwrap();
    let status = wait_terminal(&state, batch_id).await;
    assert_eq!(status.stage, Stage::Complete);
    assert_eq!(status.counts.indexing.succeeded, 3);
    assert_eq!(state.index.event_len("crash-test"), 3);

    // A second process over the same data sees the finished batch and index.
    let reopened = AppState::start(cfg).await.unwrap();
    assert_eq!(reopened.index.len(), 3);
    let status = reopened.status(batch_id).await.unwrap();
    assert_eq!(status.stage, Stage::Complete);
    assert_eq!(status.gallery_link.as_deref(), Some(format!("{BASE_URL}/gallery/crash-test/{batch_id}").as_str()));
}

#[tokio::test]
async fn index_rejects_a_different_embedding_model() {
    let tmp = TempDir::new().unwrap();
    let state = start(tmp.path()).await;
    drop(state);

    let mut cfg = test_config(tmp.path());
    cfg.embed_dim = 64;
    let err = AppState::start(cfg).await.err().expect("dimension change is refused");
    assert!(matches!(err, PipelineError::Config(_)), "got {err:?}");
}
