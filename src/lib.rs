pub mod utils;
pub mod stats;
pub mod models;
pub mod db;
pub mod pipeline;
pub mod api;
pub mod error;
pub mod events;

use futures_util::stream::BoxStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::db::{query, DbPool};
use crate::error::PipelineError;
use crate::models::{BatchHandle, BatchStatus, Caller, Event, QueryMatch};
use crate::pipeline::detect::DetectionPolicy;
use crate::pipeline::gateway::{self, UploadFile};
use crate::pipeline::index::VectorIndex;
use crate::pipeline::search::{self, SearchResponse};
use crate::pipeline::tracker::StatusTracker;
use crate::pipeline::{Models, QueueGauges, Queues, StageContext};
use crate::utils::config::Config;

const POOL_SIZE: u32 = 16;

#[derive(Clone)]
pub struct AppPaths {
    pub data: PathBuf,
    pub db_path: PathBuf,
    pub images: PathBuf,
}

/// A stored photo ready to be served.
pub struct Photo {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// The running pipeline: storage, stage pools, index and tracker. Every
/// public operation of the service goes through here.
pub struct AppState {
    pub started_at: std::time::Instant,
    pub cfg: Arc<Config>,
    pub paths: AppPaths,
    pub pool: DbPool,
    pub stats: Arc<stats::Stats>,
    pub queues: Queues,
    pub gauges: Arc<QueueGauges>,
    pub tracker: Arc<StatusTracker>,
    pub index: Arc<VectorIndex>,
    pub models: Models,
}

impl AppState {
    /// Opens storage, loads the configured models and starts the stage
    /// workers. Batches left open by a previous run are resumed.
    pub async fn start(cfg: Config) -> Result<Arc<Self>, PipelineError> {
        let models = pipeline::build_models(&cfg)?;
        Self::start_with_models(cfg, models).await
    }

    pub async fn start_with_models(cfg: Config, models: Models) -> Result<Arc<Self>, PipelineError> {
        cfg.validate()?;
        if models.embedder.dimension() != cfg.embed_dim {
            return Err(PipelineError::Config(format!(
                "embedder {} produces {}-d vectors, configured dimension is {}",
                models.embedder.model_version(),
                models.embedder.dimension(),
                cfg.embed_dim
            )));
        }

        let paths = AppPaths { data: cfg.data.clone(), db_path: cfg.db_path(), images: cfg.images_dir() };
        for dir in [paths.data.join("db"), paths.images.clone()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| PipelineError::Config(format!("cannot create {}: {e}", dir.display())))?;
        }

        let db_path = paths.db_path.clone();
        let pool = tokio::task::spawn_blocking(move || db::create_pool(&db_path, POOL_SIZE)).await??;
        let metric = cfg.metric()?;
        let (p, dim, version) = (pool.clone(), cfg.embed_dim, models.embedder.model_version().to_string());
        let index = Arc::new(tokio::task::spawn_blocking(move || VectorIndex::open(p, metric, dim, &version)).await??);

        let stats = Arc::new(stats::Stats::new());
        let gauges = Arc::new(QueueGauges::default());
        let tracker = Arc::new(StatusTracker::new(
            pool.clone(),
            &cfg.public_base_url,
            Duration::from_secs(cfg.batch_retention_secs),
            stats.clone(),
        ));
        let ctx = StageContext {
            pool: pool.clone(),
            stats: stats.clone(),
            gauges: gauges.clone(),
            tracker: tracker.clone(),
            index: index.clone(),
            models: models.clone(),
            policy: DetectionPolicy::from_config(&cfg),
            max_dimension: cfg.max_dimension,
            index_max_attempts: cfg.index_max_attempts,
            index_backoff_ms: cfg.index_backoff_ms,
        };
        let queues = pipeline::start(&cfg, ctx);

        let state = Arc::new(Self {
            started_at: std::time::Instant::now(),
            cfg: Arc::new(cfg),
            paths,
            pool,
            stats,
            queues,
            gauges,
            tracker: tracker.clone(),
            index,
            models,
        });

        let recovered = tracker.recover().await?;
        if !recovered.is_empty() {
            info!(images = recovered.len(), "re-enqueueing unfinished images");
            let mut by_batch: Vec<(i64, Vec<_>)> = Vec::new();
            for job in recovered {
                match by_batch.last_mut() {
                    Some((id, jobs)) if *id == job.batch_id => jobs.push(job),
                    _ => by_batch.push((job.batch_id, vec![job])),
                }
            }
            for (batch_id, jobs) in by_batch {
                gateway::feed(state.clone(), batch_id, jobs);
            }
        }
        tracker.spawn_sweeper();
        info!(
            embed_model = %state.cfg.embed_model,
            detector = state.models.detector.model_version(),
            indexed_faces = state.index.len(),
            "pipeline started"
        );
        Ok(state)
    }

    pub fn policy(&self) -> DetectionPolicy {
        DetectionPolicy::from_config(&self.cfg)
    }

    pub async fn create_event(&self, caller: &Caller, name: &str) -> Result<Event, PipelineError> {
        let (pool, base, caller, name) = (self.pool.clone(), self.cfg.public_base_url.clone(), caller.clone(), name.to_string());
        tokio::task::spawn_blocking(move || events::create_event(&pool, &base, &caller, &name)).await?
    }

    pub async fn list_events(&self, caller: &Caller) -> Result<Vec<Event>, PipelineError> {
        let (pool, base, caller) = (self.pool.clone(), self.cfg.public_base_url.clone(), caller.clone());
        tokio::task::spawn_blocking(move || events::list_events(&pool, &base, &caller)).await?
    }

    pub async fn submit(
        self: &Arc<Self>,
        caller: &Caller,
        event_id: &str,
        images: Vec<UploadFile>,
    ) -> Result<BatchHandle, PipelineError> {
        gateway::submit(self, caller, event_id, images).await
    }

    pub async fn status(&self, batch_id: i64) -> Result<BatchStatus, PipelineError> {
        self.tracker.status(batch_id).await
    }

    pub async fn subscribe(&self, batch_id: i64) -> Result<BoxStream<'static, BatchStatus>, PipelineError> {
        self.tracker.subscribe(batch_id).await
    }

    pub async fn cancel(&self, caller: &Caller, batch_id: i64) -> Result<BatchStatus, PipelineError> {
        self.tracker.cancel(caller, batch_id).await
    }

    pub async fn query(&self, event_id: &str, probe: Vec<f32>, k: usize) -> Result<Vec<QueryMatch>, PipelineError> {
        let (pool, index, event) = (self.pool.clone(), self.index.clone(), event_id.to_string());
        let matches = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            if !query::event_exists(&conn, &event)? {
                return Err(PipelineError::not_found("event", &event));
            }
            drop(conn);
            index.query(&event, &probe, k)
        })
        .await??;
        self.stats.inc_queries();
        Ok(matches)
    }

    pub async fn search_by_selfie(self: &Arc<Self>, event_id: &str, selfie: Vec<u8>) -> Result<SearchResponse, PipelineError> {
        let (state, event) = (self.clone(), event_id.to_string());
        tokio::task::spawn_blocking(move || search::search_by_selfie(&state, &event, &selfie)).await?
    }

    pub async fn photo(&self, image_id: i64) -> Result<Photo, PipelineError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let image = query::get_image(&conn, image_id)?.ok_or_else(|| PipelineError::not_found("photo", image_id))?;
            let bytes = std::fs::read(&image.path)
                .map_err(|e| PipelineError::Internal(anyhow::anyhow!("cannot read {}: {e}", image.path.display())))?;
            Ok(Photo { bytes, content_type: gateway::content_type(&image.format) })
        })
        .await?
    }
}
