use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, error, info, warn};

use crate::db::{query, writer, DbPool};
use crate::error::{ItemFailure, PipelineError};
use crate::models::{Embedding, IndexEntry, QueryMatch};
use crate::pipeline::{distribute, StageContext};

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    /// 1 - cosine similarity.
    Cosine,
    /// Squared Euclidean distance.
    L2,
}

impl DistanceMetric {
    pub fn parse(s: &str) -> Option<DistanceMetric> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Some(DistanceMetric::Cosine),
            "l2" => Some(DistanceMetric::L2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
        }
    }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            DistanceMetric::Cosine => {
                let mut dot = 0.0f32;
                let mut na = 0.0f32;
                let mut nb = 0.0f32;
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    na += x * x;
                    nb += y * y;
                }
                if na == 0.0 || nb == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (na.sqrt() * nb.sqrt())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexWriteError {
    #[error("embedding has {got} dimensions, index expects {expected}")]
    Dimension { expected: usize, got: usize },

    #[error("embedding is from model {got}, index holds {expected}")]
    ModelVersion { expected: String, got: String },

    #[error("storage: {0}")]
    Storage(String),
}

impl IndexWriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexWriteError::Storage(_))
    }
}

/// Exact nearest-neighbour index partitioned by event.
///
/// SQLite holds the durable copy; the in-memory partitions hold complete
/// entries behind `Arc`, so a reader sees either the old entry or the new
/// one and never anything in between.
pub struct VectorIndex {
    pool: DbPool,
    metric: DistanceMetric,
    dim: usize,
    model_version: String,
    partitions: RwLock<HashMap<String, HashMap<i64, Arc<IndexEntry>>>>,
    stripes: Vec<Mutex<()>>,
}

impl VectorIndex {
    /// Opens the index, pinning metric, dimension and model version on
    /// first use and refusing to reopen with different ones.
    pub fn open(pool: DbPool, metric: DistanceMetric, dim: usize, model_version: &str) -> Result<Self, PipelineError> {
        let conn = pool.get()?;
        let meta = query::get_index_meta(&conn)?;
        let wanted = [
            ("metric", metric.as_str().to_string()),
            ("dim", dim.to_string()),
            ("model_version", model_version.to_string()),
        ];
        if meta.is_empty() {
            for (key, value) in &wanted {
                writer::put_index_meta(&conn, key, value)?;
            }
        } else {
            for (key, value) in &wanted {
                match meta.get(*key) {
                    Some(stored) if stored == value => {}
                    Some(stored) => {
                        return Err(PipelineError::Config(format!(
                            "index was created with {key}={stored}, configured {key}={value}"
                        )))
                    }
                    None => writer::put_index_meta(&conn, key, value)?,
                }
            }
        }

        let mut partitions: HashMap<String, HashMap<i64, Arc<IndexEntry>>> = HashMap::new();
        let mut loaded = 0usize;
        for entry in query::load_index_entries(&conn)? {
            if entry.embedding.len() != dim {
                warn!(face_id = entry.face_id, len = entry.embedding.len(), "skipping index entry with wrong dimension");
                continue;
            }
            loaded += 1;
            partitions.entry(entry.event_id.clone()).or_default().insert(entry.face_id, Arc::new(entry));
        }
        info!(entries = loaded, events = partitions.len(), metric = metric.as_str(), dim, "vector index loaded");

        Ok(Self {
            pool: pool.clone(),
            metric,
            dim,
            model_version: model_version.to_string(),
            partitions: RwLock::new(partitions),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.partitions.read().values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn event_len(&self, event_id: &str) -> usize {
        self.partitions.read().get(event_id).map_or(0, |p| p.len())
    }

    /// Insert or replace the entry for `face_id`. Writes to the same face
    /// serialize on a lock stripe; the durable row commits before the entry
    /// is published.
    pub fn upsert(
        &self,
        event_id: &str,
        face_id: i64,
        embedding: &Embedding,
        image_id: i64,
    ) -> Result<IndexEntry, IndexWriteError> {
        if embedding.vector.len() != self.dim {
            return Err(IndexWriteError::Dimension { expected: self.dim, got: embedding.vector.len() });
        }
        if embedding.model_version != self.model_version {
            return Err(IndexWriteError::ModelVersion {
                expected: self.model_version.clone(),
                got: embedding.model_version.clone(),
            });
        }
        let entry = IndexEntry {
            event_id: event_id.to_string(),
            face_id,
            image_id,
            embedding: embedding.vector.clone(),
            model_version: embedding.model_version.clone(),
        };

        let _stripe = self.stripes[face_id.rem_euclid(LOCK_STRIPES as i64) as usize].lock();
        {
            let mut conn = self.pool.get().map_err(|e| IndexWriteError::Storage(e.to_string()))?;
            writer::upsert_index_entry(&mut conn, &entry, chrono::Utc::now().timestamp())
                .map_err(|e| IndexWriteError::Storage(format!("{e:#}")))?;
        }

        let published = Arc::new(entry.clone());
        let mut partitions = self.partitions.write();
        for (other, faces) in partitions.iter_mut() {
            if other != event_id {
                faces.remove(&face_id);
            }
        }
        partitions.entry(entry.event_id.clone()).or_default().insert(face_id, published);
        Ok(entry)
    }

    /// Drops a face from memory. The durable row goes with its face row.
    pub fn remove(&self, event_id: &str, face_id: i64) {
        if let Some(faces) = self.partitions.write().get_mut(event_id) {
            faces.remove(&face_id);
        }
    }

    /// The `k` nearest entries of `event_id`, nearest first, ties broken by
    /// face id.
    pub fn query(&self, event_id: &str, probe: &[f32], k: usize) -> Result<Vec<QueryMatch>, PipelineError> {
        if probe.len() != self.dim {
            return Err(PipelineError::Validation(format!(
                "probe has {} dimensions, index expects {}",
                probe.len(),
                self.dim
            )));
        }
        if probe.iter().any(|x| !x.is_finite()) {
            return Err(PipelineError::Validation("probe contains non-finite values".into()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let candidates: Vec<Arc<IndexEntry>> = match self.partitions.read().get(event_id) {
            Some(faces) => faces.values().cloned().collect(),
            None => return Ok(Vec::new()),
        };

        let mut scored: Vec<(f32, Arc<IndexEntry>)> = candidates
            .into_par_iter()
            .map(|entry| (self.metric.distance(probe, &entry.embedding), entry))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.face_id.cmp(&b.1.face_id)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, entry)| QueryMatch { entry: entry.as_ref().clone(), distance })
            .collect())
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or runs
/// out of attempts. Sleeps `base * 2^(attempt-1)` between attempts.
pub fn with_backoff<T>(
    max_attempts: u32,
    base: Duration,
    mut op: impl FnMut(u32) -> Result<T, IndexWriteError>,
    mut on_retry: impl FnMut(u32, &IndexWriteError),
) -> Result<T, (u32, IndexWriteError)> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                on_retry(attempt, &e);
                std::thread::sleep(base.saturating_mul(1u32 << (attempt - 1).min(16)));
                attempt += 1;
            }
            Err(e) => return Err((attempt, e)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexJob {
    pub batch_id: i64,
    pub event_id: String,
    pub image_id: i64,
    pub embedding: Embedding,
}

fn process_entry(ctx: &StageContext, job: &IndexJob) -> anyhow::Result<()> {
    let face_id = job.embedding.face_id;
    let result = with_backoff(
        ctx.index_max_attempts,
        Duration::from_millis(ctx.index_backoff_ms),
        |_| ctx.index.upsert(&job.event_id, face_id, &job.embedding, job.image_id),
        |attempt, e| {
            ctx.stats.inc_index_retries();
            warn!(batch_id = job.batch_id, face_id, attempt, error = %e, "index write failed, retrying");
        },
    );
    match result {
        Ok(_) => {
            ctx.stats.inc_faces_indexed();
            debug!(batch_id = job.batch_id, face_id, "face indexed");
        }
        Err((attempts, e)) => {
            let failure = ItemFailure::IndexWrite { attempts, reason: e.to_string() };
            warn!(batch_id = job.batch_id, face_id, error = %failure, "face not indexed");
            let conn = ctx.pool.get()?;
            writer::mark_face_index_failed(&conn, face_id, &failure)?;
            ctx.stats.inc_faces_index_failed();
        }
    }
    Ok(())
}

pub fn start_workers(n: usize, rx: Receiver<IndexJob>, ctx: StageContext) {
    for mut worker_rx in distribute(n, rx) {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(job) = worker_rx.recv().await {
                ctx.gauges.index.fetch_sub(1, Ordering::Relaxed);
                if ctx.tracker.should_skip(job.batch_id) {
                    debug!(batch_id = job.batch_id, face_id = job.embedding.face_id, "dropping index job for inactive batch");
                    continue;
                }
                let c = ctx.clone();
                let j = job.clone();
                match tokio::task::spawn_blocking(move || process_entry(&c, &j)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(batch_id = job.batch_id, face_id = job.embedding.face_id, error = ?e, "index stage error"),
                    Err(e) => error!(batch_id = job.batch_id, face_id = job.embedding.face_id, error = %e, "index task panicked"),
                }
                ctx.tracker.refresh(job.batch_id).await;
            }
        });
    }
}
