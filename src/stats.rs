use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide counters. Everything is relaxed; the numbers are for
/// dashboards, not for correctness.
pub struct Stats {
    batches_submitted: AtomicU64,
    batches_completed: AtomicU64,
    batches_cancelled: AtomicU64,
    images_staged: AtomicU64,
    bytes_staged: AtomicU64,
    images_decoded: AtomicU64,
    images_failed: AtomicU64,
    faces_detected: AtomicU64,
    faces_embedded: AtomicU64,
    faces_embed_failed: AtomicU64,
    faces_indexed: AtomicU64,
    faces_index_failed: AtomicU64,
    index_retries: AtomicU64,
    queries: AtomicU64,
    started: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub batches_submitted: u64,
    pub batches_completed: u64,
    pub batches_cancelled: u64,
    pub images_staged: u64,
    pub bytes_staged: u64,
    pub images_decoded: u64,
    pub images_failed: u64,
    pub faces_detected: u64,
    pub faces_embedded: u64,
    pub faces_embed_failed: u64,
    pub faces_indexed: u64,
    pub faces_index_failed: u64,
    pub index_retries: u64,
    pub queries: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            batches_submitted: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
            batches_cancelled: AtomicU64::new(0),
            images_staged: AtomicU64::new(0),
            bytes_staged: AtomicU64::new(0),
            images_decoded: AtomicU64::new(0),
            images_failed: AtomicU64::new(0),
            faces_detected: AtomicU64::new(0),
            faces_embedded: AtomicU64::new(0),
            faces_embed_failed: AtomicU64::new(0),
            faces_indexed: AtomicU64::new(0),
            faces_index_failed: AtomicU64::new(0),
            index_retries: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn inc_batches_submitted(&self) { self.batches_submitted.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_batches_completed(&self) { self.batches_completed.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_batches_cancelled(&self) { self.batches_cancelled.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_images_staged(&self, n: u64, bytes: u64) {
        self.images_staged.fetch_add(n, Ordering::Relaxed);
        self.bytes_staged.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn inc_images_decoded(&self) { self.images_decoded.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_images_failed(&self) { self.images_failed.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_faces_detected(&self, n: u64) { self.faces_detected.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_faces_embedded(&self) { self.faces_embedded.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_faces_embed_failed(&self) { self.faces_embed_failed.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_faces_indexed(&self) { self.faces_indexed.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_faces_index_failed(&self) { self.faces_index_failed.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_index_retries(&self) { self.index_retries.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_queries(&self) { self.queries.fetch_add(1, Ordering::Relaxed); }
    pub fn uptime_secs(&self) -> u64 { self.started.elapsed().as_secs() }

    pub fn images_per_sec(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        let done = self.images_decoded.load(Ordering::Relaxed) + self.images_failed.load(Ordering::Relaxed);
        if secs <= 0.0 { 0.0 } else { done as f64 / secs }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_cancelled: self.batches_cancelled.load(Ordering::Relaxed),
            images_staged: self.images_staged.load(Ordering::Relaxed),
            bytes_staged: self.bytes_staged.load(Ordering::Relaxed),
            images_decoded: self.images_decoded.load(Ordering::Relaxed),
            images_failed: self.images_failed.load(Ordering::Relaxed),
            faces_detected: self.faces_detected.load(Ordering::Relaxed),
            faces_embedded: self.faces_embedded.load(Ordering::Relaxed),
            faces_embed_failed: self.faces_embed_failed.load(Ordering::Relaxed),
            faces_indexed: self.faces_indexed.load(Ordering::Relaxed),
            faces_index_failed: self.faces_index_failed.load(Ordering::Relaxed),
            index_retries: self.index_retries.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
        }
    }

    pub fn metrics_text(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        out.push_str(&format!("nazr_uptime_seconds {}\n", s.uptime_secs));
        out.push_str(&format!("nazr_batches_submitted_total {}\n", s.batches_submitted));
        out.push_str(&format!("nazr_batches_completed_total {}\n", s.batches_completed));
        out.push_str(&format!("nazr_batches_cancelled_total {}\n", s.batches_cancelled));
        out.push_str(&format!("nazr_images_staged_total {}\n", s.images_staged));
        out.push_str(&format!("nazr_staged_bytes_total {}\n", s.bytes_staged));
        out.push_str(&format!("nazr_images_decoded_total {}\n", s.images_decoded));
        out.push_str(&format!("nazr_images_failed_total {}\n", s.images_failed));
        out.push_str(&format!("nazr_faces_detected_total {}\n", s.faces_detected));
        out.push_str(&format!("nazr_faces_embedded_total {}\n", s.faces_embedded));
        out.push_str(&format!("nazr_faces_embed_failed_total {}\n", s.faces_embed_failed));
        out.push_str(&format!("nazr_faces_indexed_total {}\n", s.faces_indexed));
        out.push_str(&format!("nazr_faces_index_failed_total {}\n", s.faces_index_failed));
        out.push_str(&format!("nazr_index_retries_total {}\n", s.index_retries));
        out.push_str(&format!("nazr_queries_total {}\n", s.queries));
        out.push_str(&format!("nazr_images_per_second {}\n", self.images_per_sec()));
        out
    }
}
