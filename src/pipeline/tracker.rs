use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{query, writer, DbPool};
use crate::error::PipelineError;
use crate::models::{gallery_link, BatchStatus, Caller, Stage};
use crate::pipeline::detect::DetectJob;
use crate::stats::Stats;

struct TrackState {
    status: BatchStatus,
    persisted_stage: Stage,
}

/// Live state of one batch. The watch channel carries the latest merged
/// snapshot; readers never touch the stage workers' locks.
pub struct BatchTracker {
    batch_id: i64,
    event_id: String,
    cancelled: AtomicBool,
    state: Mutex<TrackState>,
    tx: watch::Sender<BatchStatus>,
}

impl BatchTracker {
    fn new(status: BatchStatus, persisted_stage: Stage) -> Self {
        let (tx, _rx) = watch::channel(status.clone());
        Self {
            batch_id: status.batch_id,
            event_id: status.event_id.clone(),
            cancelled: AtomicBool::new(status.cancelled),
            state: Mutex::new(TrackState { status, persisted_stage }),
            tx,
        }
    }

    pub fn batch_id(&self) -> i64 {
        self.batch_id
    }

    pub fn snapshot(&self) -> BatchStatus {
        self.state.lock().status.clone()
    }
}

pub struct StatusTracker {
    pool: DbPool,
    public_base_url: String,
    retention: Duration,
    stats: Arc<Stats>,
    batches: RwLock<HashMap<i64, Arc<BatchTracker>>>,
}

impl StatusTracker {
    pub fn new(pool: DbPool, public_base_url: &str, retention: Duration, stats: Arc<Stats>) -> Self {
        Self {
            pool,
            public_base_url: public_base_url.to_string(),
            retention,
            stats,
            batches: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, batch_id: i64) -> Option<Arc<BatchTracker>> {
        self.batches.read().get(&batch_id).cloned()
    }

    fn insert(&self, status: BatchStatus, persisted_stage: Stage) -> Arc<BatchTracker> {
        let tracker = Arc::new(BatchTracker::new(status, persisted_stage));
        self.batches.write().insert(tracker.batch_id, tracker.clone());
        tracker
    }

    /// Starts tracking a freshly staged batch.
    pub fn register(&self, batch_id: i64, event_id: &str, images_total: u64) -> Arc<BatchTracker> {
        self.insert(BatchStatus::staged(batch_id, event_id, images_total), Stage::Staged)
    }

    pub fn tracked(&self) -> usize {
        self.batches.read().len()
    }

    pub fn is_cancelled(&self, batch_id: i64) -> bool {
        self.get(batch_id).map_or(false, |t| t.cancelled.load(Ordering::Acquire))
    }

    /// Workers drop jobs of batches that are cancelled, finished or gone.
    pub fn should_skip(&self, batch_id: i64) -> bool {
        match self.get(batch_id) {
            Some(t) => t.cancelled.load(Ordering::Acquire) || t.state.lock().status.is_terminal(),
            None => true,
        }
    }

    /// First pickup by a detection worker moves the batch out of `staged`.
    pub fn mark_started(&self, batch_id: i64) {
        let Some(t) = self.get(batch_id) else { return };
        let mut st = t.state.lock();
        if st.status.stage < Stage::Detecting {
            st.status.stage = Stage::Detecting;
            t.tx.send_replace(st.status.clone());
        }
    }

    /// Re-reads the durable counts, merges them into the published
    /// snapshot and persists stage changes. Completing a batch freezes it.
    pub async fn refresh(&self, batch_id: i64) {
        let Some(t) = self.get(batch_id) else { return };
        if t.cancelled.load(Ordering::Acquire) {
            return;
        }

        let pool = self.pool.clone();
        let counts = match tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let conn = pool.get()?;
            query::batch_counts(&conn, batch_id)
        })
        .await
        {
            Ok(Ok(counts)) => counts,
            Ok(Err(e)) => {
                warn!(batch_id, error = ?e, "could not read batch counts");
                return;
            }
            Err(e) => {
                error!(batch_id, error = %e, "count task panicked");
                return;
            }
        };
        let derived = BatchStatus::derive(batch_id, &t.event_id, counts, false, &self.public_base_url);

        let changed_stage = {
            let mut st = t.state.lock();
            if st.status.is_terminal() || t.cancelled.load(Ordering::Acquire) {
                return;
            }
            let next = st.status.merge(derived);
            let changed = (next.stage != st.persisted_stage).then_some(next.stage);
            if let Some(stage) = changed {
                st.persisted_stage = stage;
            }
            st.status = next.clone();
            t.tx.send_replace(next);
            changed
        };

        if let Some(stage) = changed_stage {
            self.persist_stage(batch_id, &t.event_id, stage).await;
        }
    }

    async fn persist_stage(&self, batch_id: i64, event_id: &str, stage: Stage) {
        let pool = self.pool.clone();
        let link = gallery_link(&self.public_base_url, event_id, batch_id);
        let res = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = pool.get()?;
            if stage == Stage::Complete {
                writer::complete_batch(&conn, batch_id, &link, chrono::Utc::now().timestamp())
            } else {
                writer::set_batch_stage(&conn, batch_id, stage)?;
                Ok(false)
            }
        })
        .await;
        match res {
            Ok(Ok(true)) => {
                self.stats.inc_batches_completed();
                info!(batch_id, event_id, "batch complete");
            }
            Ok(Ok(false)) => debug!(batch_id, stage = stage.as_str(), "batch stage persisted"),
            Ok(Err(e)) => warn!(batch_id, error = ?e, "could not persist batch stage"),
            Err(e) => error!(batch_id, error = %e, "stage persist task panicked"),
        }
    }

    async fn status_from_db(&self, batch_id: i64) -> Result<BatchStatus, PipelineError> {
        let pool = self.pool.clone();
        let base = self.public_base_url.clone();
        tokio::task::spawn_blocking(move || -> Result<BatchStatus, PipelineError> {
            let conn = pool.get()?;
            let batch = query::get_batch(&conn, batch_id)?.ok_or_else(|| PipelineError::not_found("batch", batch_id))?;
            let counts = query::batch_counts(&conn, batch_id)?;
            let mut status = BatchStatus::derive(batch.id, &batch.event_id, counts, batch.cancelled, &base);
            if batch.stage == Stage::Complete {
                status.stage = Stage::Complete;
                status.completion = 1.0;
                status.gallery_link = batch.gallery_link.or(status.gallery_link);
            } else if status.stage == Stage::Complete && batch.completed_at.is_none() {
                // counts are done but the tracker has not frozen it yet
                status.stage = Stage::Indexing;
                status.gallery_link = None;
            }
            Ok(status)
        })
        .await?
    }

    pub async fn status(&self, batch_id: i64) -> Result<BatchStatus, PipelineError> {
        match self.get(batch_id) {
            Some(t) => Ok(t.snapshot()),
            None => self.status_from_db(batch_id).await,
        }
    }

    /// Snapshots from now on: the current one first, then every change,
    /// ending after a terminal snapshot or when the batch expires.
    pub async fn subscribe(&self, batch_id: i64) -> Result<BoxStream<'static, BatchStatus>, PipelineError> {
        let Some(t) = self.get(batch_id) else {
            let status = self.status_from_db(batch_id).await?;
            return Ok(stream::once(async move { status }).boxed());
        };
        let rx = t.tx.subscribe();
        drop(t);
        Ok(stream::unfold((rx, true, false), |(mut rx, first, done)| async move {
            if done {
                return None;
            }
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            let terminal = snapshot.is_terminal();
            Some((snapshot, (rx, false, terminal)))
        })
        .boxed())
    }

    /// Cancels a batch. The event owner and admins may cancel; cancelling a
    /// terminal batch is a no-op that returns its status.
    pub async fn cancel(&self, caller: &Caller, batch_id: i64) -> Result<BatchStatus, PipelineError> {
        let pool = self.pool.clone();
        let (batch, event) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let conn = pool.get()?;
            let batch = query::get_batch(&conn, batch_id)?;
            let event = match &batch {
                Some(b) => query::get_event(&conn, &b.event_id)?,
                None => None,
            };
            Ok((batch, event))
        })
        .await??;
        batch.ok_or_else(|| PipelineError::not_found("batch", batch_id))?;
        let owner = event.map(|e| e.owner_id);
        if !caller.is_admin() && owner.as_deref() != Some(caller.user_id.as_str()) {
            return Err(PipelineError::Authorization(format!(
                "user {} may not cancel batch {batch_id}",
                caller.user_id
            )));
        }

        let frozen = match self.get(batch_id) {
            Some(t) => {
                let mut st = t.state.lock();
                if st.status.is_terminal() {
                    return Ok(st.status.clone());
                }
                t.cancelled.store(true, Ordering::Release);
                st.status.stage = Stage::Cancelled;
                st.status.cancelled = true;
                st.status.gallery_link = None;
                st.persisted_stage = Stage::Cancelled;
                t.tx.send_replace(st.status.clone());
                Some(st.status.clone())
            }
            None => None,
        };

        let pool = self.pool.clone();
        let updated = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = pool.get()?;
            writer::cancel_batch(&conn, batch_id, chrono::Utc::now().timestamp())
        })
        .await??;
        if updated {
            self.stats.inc_batches_cancelled();
            info!(batch_id, user_id = %caller.user_id, "batch cancelled");
        }

        match frozen {
            Some(status) => Ok(status),
            None => self.status_from_db(batch_id).await,
        }
    }

    /// Rebuilds tracking for batches left open by a previous process and
    /// returns the detection jobs still owed to them.
    pub async fn recover(&self) -> Result<Vec<DetectJob>, PipelineError> {
        let pool = self.pool.clone();
        let open = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let conn = pool.get()?;
            let mut out = Vec::new();
            for batch in query::open_batches(&conn)? {
                let counts = query::batch_counts(&conn, batch.id)?;
                let images = query::unfinished_images(&conn, batch.id)?;
                out.push((batch, counts, images));
            }
            Ok(out)
        })
        .await??;

        let mut jobs = Vec::new();
        let mut ids = Vec::with_capacity(open.len());
        for (batch, counts, images) in open {
            let mut status = BatchStatus::derive(batch.id, &batch.event_id, counts, false, &self.public_base_url);
            if status.stage == Stage::Complete {
                status.stage = Stage::Indexing;
                status.gallery_link = None;
            }
            status.stage = status.stage.max(batch.stage);
            self.insert(status, batch.stage);
            info!(batch_id = batch.id, pending_images = images.len(), "recovering batch");
            jobs.extend(images.into_iter().map(|img| DetectJob {
                batch_id: batch.id,
                event_id: batch.event_id.clone(),
                image_id: img.id,
                path: img.path,
            }));
            ids.push(batch.id);
        }
        for batch_id in ids {
            self.refresh(batch_id).await;
        }
        Ok(jobs)
    }

    /// Forgets batches that went terminal more than `retention` before
    /// `now` (unix seconds). Open subscriptions on them end.
    pub async fn sweep_expired(&self, now: i64) -> Result<usize, PipelineError> {
        let cutoff = now - self.retention.as_secs() as i64;
        let pool = self.pool.clone();
        let expired = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<i64>> {
            let conn = pool.get()?;
            writer::delete_expired_batches(&conn, cutoff)
        })
        .await??;
        if !expired.is_empty() {
            let mut batches = self.batches.write();
            for id in &expired {
                batches.remove(id);
            }
            info!(count = expired.len(), "expired batches removed");
        }
        Ok(expired.len())
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = self.clone();
        let period = self.retention.min(Duration::from_secs(60)).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = tracker.sweep_expired(chrono::Utc::now().timestamp()).await {
                    warn!(error = %e, "batch sweep failed");
                }
            }
        })
    }
}
