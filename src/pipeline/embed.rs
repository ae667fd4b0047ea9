use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{debug, error, warn};

use crate::db::writer;
use crate::error::ItemFailure;
use crate::models::Embedding;
use crate::pipeline::index::IndexJob;
use crate::pipeline::{distribute, enqueue, StageContext};

pub const LUMA_GRID_VERSION: &str = "luma-grid-v1";

/// Maps a face crop to a fixed-length vector. Same crop, same model,
/// same vector.
pub trait FaceEmbedder: Send + Sync {
    fn model_version(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>>;
}

/// Reference embedder: the crop's luminance on a `side x side` grid,
/// mean-centred and L2-normalised. Crude, but deterministic and cheap, and
/// the same person photographed the same way lands close together.
pub struct LumaGridEmbedder {
    side: u32,
}

impl LumaGridEmbedder {
    pub fn new(dim: usize) -> Result<Self> {
        let side = (dim as f64).sqrt().round() as usize;
        if side == 0 || side * side != dim {
            bail!("{LUMA_GRID_VERSION} needs a square embedding dimension, got {dim}");
        }
        Ok(Self { side: side as u32 })
    }
}

impl FaceEmbedder for LumaGridEmbedder {
    fn model_version(&self) -> &str {
        LUMA_GRID_VERSION
    }

    fn dimension(&self) -> usize {
        (self.side * self.side) as usize
    }

    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        if crop.width() == 0 || crop.height() == 0 {
            bail!("empty face crop");
        }
        let gray = imageops::grayscale(crop);
        let grid = imageops::resize(&gray, self.side, self.side, FilterType::Triangle);
        let mut v: Vec<f32> = grid.pixels().map(|p| p[0] as f32 / 255.0).collect();
        let mean = v.iter().sum::<f32>() / v.len() as f32;
        v.iter_mut().for_each(|x| *x -= mean);
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            bail!("face crop has no contrast");
        }
        v.iter_mut().for_each(|x| *x /= norm);
        Ok(v)
    }
}

/// Runs the embedder and checks what came back.
pub fn embed_face(embedder: &dyn FaceEmbedder, crop: &RgbImage) -> std::result::Result<Vec<f32>, ItemFailure> {
    let vector = embedder.embed(crop).map_err(|e| ItemFailure::Embedding(format!("{e:#}")))?;
    if vector.len() != embedder.dimension() {
        return Err(ItemFailure::Embedding(format!(
            "expected {} values, model returned {}",
            embedder.dimension(),
            vector.len()
        )));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(ItemFailure::Embedding("non-finite value in embedding".into()));
    }
    Ok(vector)
}

#[derive(Clone)]
pub struct EmbedJob {
    pub batch_id: i64,
    pub event_id: String,
    pub image_id: i64,
    pub face_id: i64,
    pub crop: Arc<RgbImage>,
}

/// Embeds and persists one face. `Ok(None)` means the face failed and was
/// recorded as such.
fn process_face(ctx: &StageContext, job: &EmbedJob) -> Result<Option<Embedding>> {
    let embedder = ctx.models.embedder.as_ref();
    let outcome = embed_face(embedder, &job.crop);
    let mut conn = ctx.pool.get()?;
    match outcome {
        Ok(vector) => {
            let embedding = Embedding { face_id: job.face_id, vector, model_version: embedder.model_version().to_string() };
            writer::store_embedding(&mut conn, &embedding)?;
            ctx.stats.inc_faces_embedded();
            Ok(Some(embedding))
        }
        Err(failure) => {
            warn!(batch_id = job.batch_id, face_id = job.face_id, error = %failure, "face not embedded");
            writer::mark_face_embed_failed(&conn, job.face_id, &failure)?;
            ctx.stats.inc_faces_embed_failed();
            Ok(None)
        }
    }
}

async fn record_stage_error(ctx: &StageContext, face_id: i64, reason: String) {
    let pool = ctx.pool.clone();
    let res = tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = pool.get()?;
        writer::mark_face_embed_failed(&conn, face_id, &ItemFailure::Embedding(reason))
    })
    .await;
    match res {
        Ok(Ok(())) => ctx.stats.inc_faces_embed_failed(),
        Ok(Err(e)) => error!(face_id, error = ?e, "could not record embedding failure"),
        Err(e) => error!(face_id, error = %e, "failure recording task panicked"),
    }
}

pub fn start_workers(n: usize, rx: Receiver<EmbedJob>, tx: Sender<IndexJob>, ctx: StageContext) {
    for mut worker_rx in distribute(n, rx) {
        let txc = tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(job) = worker_rx.recv().await {
                ctx.gauges.embed.fetch_sub(1, Ordering::Relaxed);
                if ctx.tracker.should_skip(job.batch_id) {
                    debug!(batch_id = job.batch_id, face_id = job.face_id, "dropping embed job for inactive batch");
                    continue;
                }

                let c = ctx.clone();
                let j = job.clone();
                let embedding = match tokio::task::spawn_blocking(move || process_face(&c, &j)).await {
                    Ok(Ok(embedding)) => embedding,
                    Ok(Err(e)) => {
                        error!(batch_id = job.batch_id, face_id = job.face_id, error = ?e, "embedding commit failed");
                        record_stage_error(&ctx, job.face_id, format!("storage: {e:#}")).await;
                        None
                    }
                    Err(e) => {
                        error!(batch_id = job.batch_id, face_id = job.face_id, error = %e, "embedding task panicked");
                        record_stage_error(&ctx, job.face_id, "embedder panicked".to_string()).await;
                        None
                    }
                };

                if let Some(embedding) = embedding {
                    let index_job = IndexJob {
                        batch_id: job.batch_id,
                        event_id: job.event_id.clone(),
                        image_id: job.image_id,
                        embedding,
                    };
                    enqueue(&txc, &ctx.gauges.index, index_job).await;
                }
                ctx.tracker.refresh(job.batch_id).await;
            }
        });
    }
}
