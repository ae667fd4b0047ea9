use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a batch. Variant order is the progress order, so `Ord`
/// doubles as the "never regress" check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Staged,
    Detecting,
    Embedding,
    Indexing,
    Complete,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Staged => "staged",
            Stage::Detecting => "detecting",
            Stage::Embedding => "embedding",
            Stage::Indexing => "indexing",
            Stage::Complete => "complete",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "staged" => Some(Stage::Staged),
            "detecting" => Some(Stage::Detecting),
            "embedding" => Some(Stage::Embedding),
            "indexing" => Some(Stage::Indexing),
            "complete" => Some(Stage::Complete),
            "cancelled" => Some(Stage::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStatus {
    Pending,
    Decoded,
    Failed,
}

impl DecodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeStatus::Pending => "pending",
            DecodeStatus::Decoded => "decoded",
            DecodeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> DecodeStatus {
        match s {
            "decoded" => DecodeStatus::Decoded,
            "failed" => DecodeStatus::Failed,
            _ => DecodeStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub succeeded: u64,
    pub failed: u64,
}

impl StageCounts {
    pub fn done(&self) -> u64 {
        self.succeeded + self.failed
    }

    fn max(self, other: StageCounts) -> StageCounts {
        StageCounts {
            succeeded: self.succeeded.max(other.succeeded),
            failed: self.failed.max(other.failed),
        }
    }
}

/// Per-stage progress, derived from the durable per-item status columns.
///
/// `detection` accounts for images, `embedding` for detected faces and
/// `indexing` for faces that were embedded successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub images_total: u64,
    pub detection: StageCounts,
    pub decode_failures: u64,
    pub faces_detected: u64,
    pub embedding: StageCounts,
    pub indexing: StageCounts,
}

impl BatchCounts {
    pub fn detection_done(&self) -> bool {
        self.detection.done() >= self.images_total
    }

    pub fn is_complete(&self) -> bool {
        self.detection_done()
            && self.embedding.done() >= self.faces_detected
            && self.indexing.done() >= self.embedding.succeeded
    }

    pub fn has_failures(&self) -> bool {
        self.detection.failed > 0 || self.embedding.failed > 0 || self.indexing.failed > 0
    }

    /// Earliest stage that still has outstanding work.
    pub fn stage(&self) -> Stage {
        if self.detection.done() == 0 && self.faces_detected == 0 {
            Stage::Staged
        } else if !self.detection_done() {
            Stage::Detecting
        } else if self.embedding.done() < self.faces_detected {
            Stage::Embedding
        } else if self.indexing.done() < self.embedding.succeeded {
            Stage::Indexing
        } else {
            Stage::Complete
        }
    }

    pub fn completion(&self) -> f64 {
        let units = self.images_total + self.faces_detected + self.embedding.succeeded;
        if units == 0 {
            return 0.0;
        }
        let done = self.detection.done() + self.embedding.done() + self.indexing.done();
        (done as f64 / units as f64).clamp(0.0, 1.0)
    }

    fn max(self, other: BatchCounts) -> BatchCounts {
        BatchCounts {
            images_total: self.images_total.max(other.images_total),
            detection: self.detection.max(other.detection),
            decode_failures: self.decode_failures.max(other.decode_failures),
            faces_detected: self.faces_detected.max(other.faces_detected),
            embedding: self.embedding.max(other.embedding),
            indexing: self.indexing.max(other.indexing),
        }
    }
}

/// Read-only projection served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: i64,
    pub event_id: String,
    pub stage: Stage,
    pub counts: BatchCounts,
    pub completion: f64,
    pub partial_failure: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gallery_link: Option<String>,
}

impl BatchStatus {
    pub fn staged(batch_id: i64, event_id: &str, images_total: u64) -> Self {
        Self {
            batch_id,
            event_id: event_id.to_string(),
            stage: Stage::Staged,
            counts: BatchCounts { images_total, ..BatchCounts::default() },
            completion: 0.0,
            partial_failure: false,
            cancelled: false,
            gallery_link: None,
        }
    }

    /// Projection of a fresh counts read. A complete batch gets its
    /// gallery link here so every path derives it the same way.
    pub fn derive(batch_id: i64, event_id: &str, counts: BatchCounts, cancelled: bool, public_base_url: &str) -> Self {
        let stage = if cancelled { Stage::Cancelled } else { counts.stage() };
        let gallery_link = (stage == Stage::Complete).then(|| gallery_link(public_base_url, event_id, batch_id));
        Self {
            batch_id,
            event_id: event_id.to_string(),
            stage,
            completion: if stage == Stage::Complete { 1.0 } else { counts.completion() },
            partial_failure: counts.has_failures(),
            cancelled,
            counts,
            gallery_link,
        }
    }

    /// Monotonic merge: counts and completion take the max, stage never
    /// regresses and flags only ever turn on.
    pub fn merge(&self, next: BatchStatus) -> BatchStatus {
        let stage = self.stage.max(next.stage);
        let cancelled = self.cancelled || next.cancelled;
        BatchStatus {
            batch_id: self.batch_id,
            event_id: self.event_id.clone(),
            stage,
            counts: self.counts.max(next.counts),
            completion: self.completion.max(next.completion),
            partial_failure: self.partial_failure || next.partial_failure,
            cancelled,
            gallery_link: if stage == Stage::Complete { next.gallery_link.or_else(|| self.gallery_link.clone()) } else { None },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

pub fn gallery_link(public_base_url: &str, event_id: &str, batch_id: i64) -> String {
    format!("{}/gallery/{}/{}", public_base_url.trim_end_matches('/'), event_id, batch_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub batch_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub event_id: String,
    pub uploader_id: String,
    pub created_at: i64,
    pub stage: Stage,
    pub cancelled: bool,
    pub completed_at: Option<i64>,
    pub gallery_link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedImage {
    pub id: i64,
    pub batch_id: i64,
    pub event_id: String,
    pub ordinal: i64,
    pub path: PathBuf,
    pub sha256: String,
    pub xxh64: i64,
    pub size_bytes: i64,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub decode_status: DecodeStatus,
    pub failure_kind: Option<String>,
    pub face_count: i64,
}
