use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::PipelineError;
use crate::pipeline::index::DistanceMetric;

#[derive(Clone, Debug)]
pub struct Config {
    pub data: PathBuf,
    pub port: u16,
    pub public_base_url: String,
    pub detect_threads: usize,
    pub embed_threads: usize,
    pub index_threads: usize,
    pub queue_capacity: usize,
    pub face_confidence_threshold: f32,
    pub face_max_per_image: usize,
    pub face_nms_iou_threshold: f32,
    pub face_min_size: u32,
    pub min_image_dimension: u32,
    pub max_dimension: u32,
    pub max_upload_bytes: usize,
    pub max_request_bytes: usize,
    pub embed_model: String,
    pub embed_dim: usize,
    pub distance_metric: String,
    pub index_max_attempts: u32,
    pub index_backoff_ms: u64,
    pub batch_retention_secs: u64,
    pub search_max_distance: f32,
    pub search_k: usize,
    pub models_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data = PathBuf::from("/nazr-data");
        Self {
            models_dir: data.join("models"),
            data,
            port: 9171,
            public_base_url: "http://localhost:3000".to_string(),
            detect_threads: 2,
            embed_threads: 2,
            index_threads: 1,
            queue_capacity: 1024,
            face_confidence_threshold: 0.5,
            face_max_per_image: 32,
            face_nms_iou_threshold: 0.4,
            face_min_size: 20,
            min_image_dimension: 32,
            max_dimension: 1600,
            max_upload_bytes: 15 * 1024 * 1024,
            max_request_bytes: 256 * 1024 * 1024,
            embed_model: "luma-grid-v1".to_string(),
            embed_dim: 256,
            distance_metric: "l2".to_string(),
            index_max_attempts: 5,
            index_backoff_ms: 50,
            batch_retention_secs: 7 * 24 * 60 * 60,
            search_max_distance: 0.8,
            search_k: 100,
        }
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        let data = PathBuf::from(env::var("NAZR_DATA").unwrap_or_else(|_| d.data.to_string_lossy().to_string()));
        let models_dir = env::var("NAZR_MODELS_DIR").map(PathBuf::from).unwrap_or_else(|_| data.join("models"));
        Self {
            port: parsed("NAZR_PORT", d.port),
            public_base_url: env::var("NAZR_PUBLIC_BASE_URL").unwrap_or(d.public_base_url),
            detect_threads: parsed("NAZR_DETECT_THREADS", d.detect_threads),
            embed_threads: parsed("NAZR_EMBED_THREADS", d.embed_threads),
            index_threads: parsed("NAZR_INDEX_THREADS", d.index_threads),
            queue_capacity: parsed("NAZR_QUEUE_CAPACITY", d.queue_capacity),
            face_confidence_threshold: parsed("NAZR_FACE_CONFIDENCE_THRESHOLD", d.face_confidence_threshold),
            face_max_per_image: parsed("NAZR_FACE_MAX_PER_IMAGE", d.face_max_per_image),
            face_nms_iou_threshold: parsed("NAZR_FACE_NMS_IOU_THRESHOLD", d.face_nms_iou_threshold),
            face_min_size: parsed("NAZR_FACE_MIN_SIZE", d.face_min_size),
            min_image_dimension: parsed("NAZR_MIN_IMAGE_DIMENSION", d.min_image_dimension),
            max_dimension: parsed("NAZR_MAX_DIMENSION", d.max_dimension),
            max_upload_bytes: parsed("NAZR_MAX_UPLOAD_BYTES", d.max_upload_bytes),
            max_request_bytes: parsed("NAZR_MAX_REQUEST_BYTES", d.max_request_bytes),
            embed_model: env::var("NAZR_EMBED_MODEL").unwrap_or(d.embed_model),
            embed_dim: parsed("NAZR_EMBED_DIM", d.embed_dim),
            distance_metric: env::var("NAZR_DISTANCE_METRIC").unwrap_or(d.distance_metric),
            index_max_attempts: parsed("NAZR_INDEX_MAX_ATTEMPTS", d.index_max_attempts),
            index_backoff_ms: parsed("NAZR_INDEX_BACKOFF_MS", d.index_backoff_ms),
            batch_retention_secs: parsed("NAZR_BATCH_RETENTION_SECS", d.batch_retention_secs),
            search_max_distance: parsed("NAZR_SEARCH_MAX_DISTANCE", d.search_max_distance),
            search_k: parsed("NAZR_SEARCH_K", d.search_k),
            data,
            models_dir,
        }
    }

    pub fn with_data_dir(mut self, data: impl Into<PathBuf>) -> Self {
        self.data = data.into();
        self.models_dir = self.data.join("models");
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data.join("db").join("nazr.db")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data.join("images")
    }

    pub fn metric(&self) -> Result<DistanceMetric, PipelineError> {
        DistanceMetric::parse(&self.distance_metric)
            .ok_or_else(|| PipelineError::Config(format!("unknown distance metric '{}'", self.distance_metric)))
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let bad = |msg: String| Err(PipelineError::Config(msg));
        if self.detect_threads == 0 || self.embed_threads == 0 || self.index_threads == 0 {
            return bad("worker counts must be at least 1".into());
        }
        if self.queue_capacity == 0 {
            return bad("queue capacity must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.face_confidence_threshold) {
            return bad(format!("face confidence threshold {} outside [0, 1]", self.face_confidence_threshold));
        }
        if !(0.0..=1.0).contains(&self.face_nms_iou_threshold) {
            return bad(format!("NMS IoU threshold {} outside [0, 1]", self.face_nms_iou_threshold));
        }
        if self.face_max_per_image == 0 {
            return bad("face cap per image must be at least 1".into());
        }
        if self.max_dimension < self.min_image_dimension {
            return bad("max dimension is smaller than the minimum image dimension".into());
        }
        if self.embed_dim == 0 {
            return bad("embedding dimension must be at least 1".into());
        }
        if self.index_max_attempts == 0 {
            return bad("index write attempts must be at least 1".into());
        }
        if !self.search_max_distance.is_finite() || self.search_max_distance < 0.0 {
            return bad(format!("search max distance {} is invalid", self.search_max_distance));
        }
        self.metric()?;
        Ok(())
    }
}
