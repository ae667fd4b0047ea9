pub mod gateway;
pub mod detect;
pub mod embed;
pub mod index;
pub mod tracker;
pub mod quality;
pub mod search;
#[cfg(feature = "onnx")]
pub mod onnx;

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::db::DbPool;
use crate::error::PipelineError;
use crate::stats::Stats;
use crate::utils::config::Config;
use detect::{DetectJob, DetectionPolicy, FaceDetector, SkinRegionDetector};
use embed::{EmbedJob, FaceEmbedder, LumaGridEmbedder};
use index::{IndexJob, VectorIndex};
use tracker::StatusTracker;

// Per-worker channel depth behind the round-robin distributor.
const WORKER_QUEUE: usize = 16;

#[derive(Clone)]
pub struct Queues {
    pub detect_tx: Sender<DetectJob>,
    pub embed_tx: Sender<EmbedJob>,
    pub index_tx: Sender<IndexJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub detect: usize,
    pub embed: usize,
    pub index: usize,
}

#[derive(Default)]
pub struct QueueGauges {
    pub detect: AtomicUsize,
    pub embed: AtomicUsize,
    pub index: AtomicUsize,
}

impl QueueGauges {
    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            detect: self.detect.load(Ordering::Relaxed),
            embed: self.embed.load(Ordering::Relaxed),
            index: self.index.load(Ordering::Relaxed),
        }
    }
}

/// Detector and embedder in use. Both are fixed for the life of the
/// process; the embedder's version and dimension are pinned in index meta.
#[derive(Clone)]
pub struct Models {
    pub detector: Arc<dyn FaceDetector>,
    pub embedder: Arc<dyn FaceEmbedder>,
}

pub fn build_models(cfg: &Config) -> Result<Models, PipelineError> {
    match cfg.embed_model.as_str() {
        embed::LUMA_GRID_VERSION => {
            let embedder = LumaGridEmbedder::new(cfg.embed_dim).map_err(|e| PipelineError::Config(e.to_string()))?;
            Ok(Models { detector: Arc::new(SkinRegionDetector::default()), embedder: Arc::new(embedder) })
        }
        #[cfg(feature = "onnx")]
        onnx::ARCFACE_VERSION => {
            if cfg.embed_dim != onnx::ARCFACE_DIM {
                return Err(PipelineError::Config(format!(
                    "{} produces {}-d embeddings, configured dimension is {}",
                    onnx::ARCFACE_VERSION,
                    onnx::ARCFACE_DIM,
                    cfg.embed_dim
                )));
            }
            let detector = onnx::ScrfdDetector::load(&cfg.models_dir).map_err(|e| PipelineError::Config(format!("{e:#}")))?;
            let embedder = onnx::ArcFaceEmbedder::load(&cfg.models_dir).map_err(|e| PipelineError::Config(format!("{e:#}")))?;
            Ok(Models { detector: Arc::new(detector), embedder: Arc::new(embedder) })
        }
        other => Err(PipelineError::Config(format!("unknown embedding model '{other}'"))),
    }
}

/// Everything a stage worker needs besides its own queues.
#[derive(Clone)]
pub struct StageContext {
    pub pool: DbPool,
    pub stats: Arc<Stats>,
    pub gauges: Arc<QueueGauges>,
    pub tracker: Arc<StatusTracker>,
    pub index: Arc<VectorIndex>,
    pub models: Models,
    pub policy: DetectionPolicy,
    pub max_dimension: u32,
    pub index_max_attempts: u32,
    pub index_backoff_ms: u64,
}

/// Fans one stage queue out to `n` workers. Each worker gets its own
/// channel and the distributor round-robins jobs across them.
pub(crate) fn distribute<T: Send + 'static>(n: usize, mut rx: Receiver<T>) -> Vec<Receiver<T>> {
    let mut worker_txs = Vec::new();
    let mut worker_rxs = Vec::new();
    for _ in 0..n.max(1) {
        let (wt, wr) = mpsc::channel::<T>(WORKER_QUEUE);
        worker_txs.push(wt);
        worker_rxs.push(wr);
    }

    tokio::spawn(async move {
        let mut idx = 0usize;
        while let Some(job) = rx.recv().await {
            let target_idx = idx % worker_txs.len();
            if worker_txs[target_idx].send(job).await.is_err() {
                break; // Worker channel closed
            }
            idx = idx.wrapping_add(1);
        }
    });

    worker_rxs
}

/// Enqueue with gauge accounting; the receiving worker decrements.
pub(crate) async fn enqueue<T>(tx: &Sender<T>, gauge: &AtomicUsize, job: T) -> bool {
    gauge.fetch_add(1, Ordering::Relaxed);
    if tx.send(job).await.is_err() {
        gauge.fetch_sub(1, Ordering::Relaxed);
        return false;
    }
    true
}

/// Wires the three stage pools together and returns the queue handles.
pub fn start(cfg: &Config, ctx: StageContext) -> Queues {
    let (detect_tx, detect_rx) = mpsc::channel::<DetectJob>(cfg.queue_capacity);
    let (embed_tx, embed_rx) = mpsc::channel::<EmbedJob>(cfg.queue_capacity);
    let (index_tx, index_rx) = mpsc::channel::<IndexJob>(cfg.queue_capacity);

    detect::start_workers(cfg.detect_threads, detect_rx, embed_tx.clone(), ctx.clone());
    embed::start_workers(cfg.embed_threads, embed_rx, index_tx.clone(), ctx.clone());
    index::start_workers(cfg.index_threads, index_rx, ctx);

    Queues { detect_tx, embed_tx, index_tx }
}
