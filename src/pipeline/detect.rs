use anyhow::Result;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{debug, error, warn};

use crate::db::writer;
use crate::error::ItemFailure;
use crate::models::{BoundingBox, FaceCandidate, FaceDetection};
use crate::pipeline::embed::EmbedJob;
use crate::pipeline::{distribute, enqueue, StageContext};
use crate::utils::config::Config;

pub const SKIN_REGION_VERSION: &str = "skin-region-v1";

/// A face detector is a pure function of the pixels it is given.
pub trait FaceDetector: Send + Sync {
    fn model_version(&self) -> &str;
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceCandidate>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionPolicy {
    pub confidence_threshold: f32,
    pub max_faces: usize,
    pub nms_iou_threshold: f32,
    pub min_face_size: u32,
}

impl DetectionPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            confidence_threshold: cfg.face_confidence_threshold,
            max_faces: cfg.face_max_per_image,
            nms_iou_threshold: cfg.face_nms_iou_threshold,
            min_face_size: cfg.face_min_size,
        }
    }
}

/// Confidence desc, then top-to-bottom, then left-to-right. Sizes break the
/// remaining ties so the order is total.
fn detection_order(a: &FaceCandidate, b: &FaceCandidate) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(a.bbox.y.cmp(&b.bbox.y))
        .then(a.bbox.x.cmp(&b.bbox.x))
        .then(a.bbox.w.cmp(&b.bbox.w))
        .then(a.bbox.h.cmp(&b.bbox.h))
}

/// Threshold, minimum size, greedy IoU suppression and the per-image cap.
/// The output order is the ordinal order.
pub fn apply_policy(candidates: Vec<FaceCandidate>, policy: &DetectionPolicy) -> Vec<FaceCandidate> {
    let mut kept: Vec<FaceCandidate> = candidates
        .into_iter()
        .filter(|c| {
            c.confidence.is_finite()
                && c.confidence >= policy.confidence_threshold
                && c.bbox.w >= policy.min_face_size
                && c.bbox.h >= policy.min_face_size
        })
        .collect();
    kept.sort_by(detection_order);

    let mut out: Vec<FaceCandidate> = Vec::with_capacity(kept.len().min(policy.max_faces));
    for candidate in kept {
        if out.len() >= policy.max_faces {
            break;
        }
        if out.iter().any(|k| k.bbox.iou(&candidate.bbox) > policy.nms_iou_threshold) {
            continue;
        }
        out.push(candidate);
    }
    out
}

/// Runs `detector` on `image`, downscaling first when the longest side is
/// over `max_dimension`. Boxes come back in the original pixel space.
pub fn detect_faces(
    detector: &dyn FaceDetector,
    image: &RgbImage,
    policy: &DetectionPolicy,
    max_dimension: u32,
) -> Result<Vec<FaceCandidate>> {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    let candidates = if max_dimension > 0 && longest > max_dimension {
        let scale = max_dimension as f32 / longest as f32;
        let nw = ((w as f32 * scale).round() as u32).max(1);
        let nh = ((h as f32 * scale).round() as u32).max(1);
        let small = imageops::resize(image, nw, nh, FilterType::Triangle);
        detector
            .detect(&small)?
            .into_iter()
            .filter_map(|c| {
                let b = c.bbox;
                let scaled = BoundingBox {
                    x: (b.x as f32 / scale).floor() as u32,
                    y: (b.y as f32 / scale).floor() as u32,
                    w: (b.w as f32 / scale).ceil() as u32,
                    h: (b.h as f32 / scale).ceil() as u32,
                };
                scaled.clamp(w, h).map(|bbox| FaceCandidate { bbox, confidence: c.confidence })
            })
            .collect()
    } else {
        detector
            .detect(image)?
            .into_iter()
            .filter_map(|c| c.bbox.clamp(w, h).map(|bbox| FaceCandidate { bbox, confidence: c.confidence }))
            .collect()
    };
    Ok(apply_policy(candidates, policy))
}

pub fn crop(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    imageops::crop_imm(image, bbox.x, bbox.y, bbox.w, bbox.h).to_image()
}

/// Pure-Rust reference detector: skin-tone cells on a coarse grid, grouped
/// into 4-connected regions and scored by how face-shaped they are.
pub struct SkinRegionDetector {
    pub max_grid: u32,
    pub min_cells: usize,
}

impl Default for SkinRegionDetector {
    fn default() -> Self {
        Self { max_grid: 160, min_cells: 4 }
    }
}

// An ellipse fills pi/4 of its bounding box; faces run about 1.3 tall.
const TARGET_FILL: f32 = 0.785;
const TARGET_ASPECT: f32 = 1.3;

fn is_skin(r: f32, g: f32, b: f32) -> bool {
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    y > 40.0 && (77.0..=127.0).contains(&cb) && (133.0..=173.0).contains(&cr)
}

impl FaceDetector for SkinRegionDetector {
    fn model_version(&self) -> &str {
        SKIN_REGION_VERSION
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceCandidate>> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Ok(Vec::new());
        }
        let max_grid = self.max_grid.max(1);
        let cell = ((w.max(h) + max_grid - 1) / max_grid).max(1);
        let gw = (w + cell - 1) / cell;
        let gh = (h + cell - 1) / cell;

        let mut mask = vec![false; (gw * gh) as usize];
        for gy in 0..gh {
            for gx in 0..gw {
                let (x0, y0) = (gx * cell, gy * cell);
                let (x1, y1) = ((x0 + cell).min(w), (y0 + cell).min(h));
                let mut sum = [0u64; 3];
                let mut n = 0u64;
                for y in y0..y1 {
                    for x in x0..x1 {
                        let p = image.get_pixel(x, y);
                        sum[0] += p[0] as u64;
                        sum[1] += p[1] as u64;
                        sum[2] += p[2] as u64;
                        n += 1;
                    }
                }
                let n = n.max(1) as f32;
                mask[(gy * gw + gx) as usize] = is_skin(sum[0] as f32 / n, sum[1] as f32 / n, sum[2] as f32 / n);
            }
        }

        let mut seen = vec![false; mask.len()];
        let mut out = Vec::new();
        for start in 0..mask.len() {
            if !mask[start] || seen[start] {
                continue;
            }
            seen[start] = true;
            let mut stack = vec![start];
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (gw, gh, 0u32, 0u32);
            let mut count = 0usize;
            while let Some(i) = stack.pop() {
                let gx = i as u32 % gw;
                let gy = i as u32 / gw;
                count += 1;
                min_x = min_x.min(gx);
                min_y = min_y.min(gy);
                max_x = max_x.max(gx);
                max_y = max_y.max(gy);
                let mut push = |nx: u32, ny: u32| {
                    let j = (ny * gw + nx) as usize;
                    if mask[j] && !seen[j] {
                        seen[j] = true;
                        stack.push(j);
                    }
                };
                if gx > 0 {
                    push(gx - 1, gy);
                }
                if gx + 1 < gw {
                    push(gx + 1, gy);
                }
                if gy > 0 {
                    push(gx, gy - 1);
                }
                if gy + 1 < gh {
                    push(gx, gy + 1);
                }
            }
            if count < self.min_cells {
                continue;
            }

            let cw = max_x - min_x + 1;
            let ch = max_y - min_y + 1;
            let aspect = ch as f32 / cw as f32;
            if !(0.6..=2.2).contains(&aspect) {
                continue;
            }
            let fill = count as f32 / (cw * ch) as f32;
            let fill_score = (1.0 - (fill - TARGET_FILL).abs() / TARGET_FILL).clamp(0.0, 1.0);
            let aspect_score = (1.0 - (aspect - TARGET_ASPECT).abs() / TARGET_ASPECT).clamp(0.0, 1.0);
            let confidence = 0.5 * fill_score + 0.5 * aspect_score;

            let bbox = BoundingBox { x: min_x * cell, y: min_y * cell, w: cw * cell, h: ch * cell };
            if let Some(bbox) = bbox.clamp(w, h) {
                out.push(FaceCandidate { bbox, confidence });
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct DetectJob {
    pub batch_id: i64,
    pub event_id: String,
    pub image_id: i64,
    pub path: PathBuf,
}

pub(crate) struct PendingFace {
    pub detection: FaceDetection,
    pub crop: RgbImage,
}

fn decode_and_detect(ctx: &StageContext, job: &DetectJob) -> std::result::Result<(RgbImage, Vec<FaceCandidate>), ItemFailure> {
    let bytes = std::fs::read(&job.path).map_err(|e| ItemFailure::Decode(format!("unreadable: {e}")))?;
    let rgb = image::load_from_memory(&bytes).map_err(|e| ItemFailure::Decode(e.to_string()))?.to_rgb8();
    let faces = detect_faces(ctx.models.detector.as_ref(), &rgb, &ctx.policy, ctx.max_dimension)
        .map_err(|e| ItemFailure::Detection(format!("{e:#}")))?;
    Ok((rgb, faces))
}

/// Decode + detect + commit for one image. Item failures are recorded and
/// yield no faces; only storage errors come back as `Err`.
fn process_image(ctx: &StageContext, job: &DetectJob) -> Result<Vec<PendingFace>> {
    let outcome = decode_and_detect(ctx, job);
    let mut conn = ctx.pool.get()?;
    match outcome {
        Ok((rgb, faces)) => {
            let recorded =
                writer::record_detections(&mut conn, job.image_id, job.batch_id, ctx.models.detector.model_version(), &faces)?;
            for face_id in &recorded.removed_face_ids {
                ctx.index.remove(&job.event_id, *face_id);
            }
            ctx.stats.inc_images_decoded();
            ctx.stats.inc_faces_detected(recorded.faces.len() as u64);
            debug!(batch_id = job.batch_id, image_id = job.image_id, faces = recorded.faces.len(), "detections committed");
            Ok(recorded
                .faces
                .into_iter()
                .filter(|f| f.needs_work)
                .map(|f| PendingFace { crop: crop(&rgb, &f.detection.bbox), detection: f.detection })
                .collect())
        }
        Err(failure) => {
            warn!(batch_id = job.batch_id, image_id = job.image_id, kind = failure.kind(), error = %failure, "image skipped");
            writer::mark_image_failed(&conn, job.image_id, &failure)?;
            ctx.stats.inc_images_failed();
            Ok(Vec::new())
        }
    }
}

/// Last resort when the normal path could not commit: account for the
/// image as a detection failure so the batch can still finish.
async fn record_stage_error(ctx: &StageContext, job: &DetectJob, reason: String) {
    let pool = ctx.pool.clone();
    let image_id = job.image_id;
    let res = tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = pool.get()?;
        writer::mark_image_failed(&conn, image_id, &ItemFailure::Detection(reason))
    })
    .await;
    match res {
        Ok(Ok(())) => ctx.stats.inc_images_failed(),
        Ok(Err(e)) => error!(image_id, error = ?e, "could not record detection failure"),
        Err(e) => error!(image_id, error = %e, "failure recording task panicked"),
    }
}

pub fn start_workers(n: usize, rx: Receiver<DetectJob>, tx: Sender<EmbedJob>, ctx: StageContext) {
    for mut worker_rx in distribute(n, rx) {
        let txc = tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(job) = worker_rx.recv().await {
                ctx.gauges.detect.fetch_sub(1, AtomicOrdering::Relaxed);
                if ctx.tracker.should_skip(job.batch_id) {
                    debug!(batch_id = job.batch_id, image_id = job.image_id, "dropping detect job for inactive batch");
                    continue;
                }
                ctx.tracker.mark_started(job.batch_id);

                let c = ctx.clone();
                let j = job.clone();
                let pending = match tokio::task::spawn_blocking(move || process_image(&c, &j)).await {
                    Ok(Ok(pending)) => pending,
                    Ok(Err(e)) => {
                        error!(batch_id = job.batch_id, image_id = job.image_id, error = ?e, "detection commit failed");
                        record_stage_error(&ctx, &job, format!("storage: {e:#}")).await;
                        Vec::new()
                    }
                    Err(e) => {
                        error!(batch_id = job.batch_id, image_id = job.image_id, error = %e, "detection task panicked");
                        record_stage_error(&ctx, &job, "detector panicked".to_string()).await;
                        Vec::new()
                    }
                };

                for face in pending {
                    let embed_job = EmbedJob {
                        batch_id: job.batch_id,
                        event_id: job.event_id.clone(),
                        image_id: job.image_id,
                        face_id: face.detection.face_id,
                        crop: Arc::new(face.crop),
                    };
                    if !enqueue(&txc, &ctx.gauges.embed, embed_job).await {
                        break;
                    }
                }
                ctx.tracker.refresh(job.batch_id).await;
            }
        });
    }
}
