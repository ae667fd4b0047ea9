use anyhow::{Context, Result};
use bytes::Bytes;
use image::ImageFormat;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::db::{query, writer, DbPool};
use crate::error::PipelineError;
use crate::events;
use crate::models::{BatchHandle, Caller};
use crate::pipeline::detect::DetectJob;
use crate::pipeline::enqueue;
use crate::AppState;

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: Option<String>,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self { filename: Some(filename.into()), bytes: bytes.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

fn extension(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::Png => Some("png"),
        ImageFormat::WebP => Some("webp"),
        ImageFormat::Gif => Some("gif"),
        ImageFormat::Bmp => Some("bmp"),
        ImageFormat::Tiff => Some("tiff"),
        _ => None,
    }
}

pub fn content_type(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tiff" | "tif" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Header-only check: size, a supported raster format and sane
/// dimensions. Pixel data is not decoded here.
pub fn inspect(bytes: &[u8], max_upload_bytes: usize, min_dimension: u32) -> Result<ImageHeader, String> {
    if bytes.is_empty() {
        return Err("file is empty".into());
    }
    if bytes.len() > max_upload_bytes {
        return Err(format!("file is {} bytes, limit is {max_upload_bytes}", bytes.len()));
    }
    let format = image::guess_format(bytes).map_err(|_| "not a recognised image format".to_string())?;
    if extension(format).is_none() {
        return Err(format!("unsupported image format {format:?}"));
    }
    let (width, height) = image::io::Reader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| format!("unreadable image header: {e}"))?;
    if width == 0 || height == 0 {
        return Err("image has zero size".into());
    }
    if width < min_dimension || height < min_dimension {
        return Err(format!("image is {width}x{height}, minimum is {min_dimension}x{min_dimension}"));
    }
    Ok(ImageHeader { format, width, height })
}

/// sha256 (hex) and xxh3 of the blob, fed in chunks like the file hasher.
pub fn content_hashes(bytes: &[u8]) -> (String, i64) {
    const CHUNK_SIZE: usize = 4 * 1024 * 1024;
    let mut xx = Xxh3::new();
    let mut sh = Sha256::new();
    for chunk in bytes.chunks(CHUNK_SIZE) {
        xx.update(chunk);
        sh.update(chunk);
    }
    (hex::encode(sh.finalize()), xx.digest() as u64 as i64)
}

/// Held shared from blob write to row commit, and exclusively while
/// removing blobs after a failed commit. Cleanup then sees every blob
/// another batch has claimed.
static BLOB_GUARD: RwLock<()> = parking_lot::const_rwlock(());

/// Writes the blob under `{images}/{sha[..2]}/{sha}.{ext}` unless it is
/// already there. Each call writes its own temp file; losing the race to
/// publish counts as already stored. Returns the path and whether this
/// call created it.
fn store_blob(images_dir: &Path, sha256: &str, ext: &str, bytes: &[u8]) -> Result<(PathBuf, bool)> {
    let dir = images_dir.join(&sha256[..2]);
    let path = dir.join(format!("{sha256}.{ext}"));
    if path.exists() {
        return Ok((path, false));
    }
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{sha256}."))
        .suffix(".tmp")
        .tempfile_in(&dir)
        .with_context(|| format!("failed to create a temp file in {}", dir.display()))?;
    tmp.write_all(bytes).with_context(|| format!("failed to write {}", tmp.path().display()))?;
    match tmp.persist_noclobber(&path) {
        Ok(_) => Ok((path, true)),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok((path, false)),
        Err(e) => Err(anyhow::Error::new(e.error).context(format!("failed to move {} into place", path.display()))),
    }
}

struct CreatedBlob {
    path: PathBuf,
    sha256: String,
    ext: &'static str,
}

struct Staged {
    batch_id: i64,
    images: usize,
    bytes: u64,
    jobs: Vec<DetectJob>,
}

/// Validate everything, then persist files and rows. Nothing is written
/// unless every file passed; a failed row insert removes the files it
/// wrote that no other batch has claimed.
fn stage_batch(state: &AppState, caller: &Caller, event_id: &str, files: &[UploadFile]) -> Result<Staged, PipelineError> {
    if files.is_empty() {
        return Err(PipelineError::Validation("batch contains no images".into()));
    }
    let event = {
        let conn = state.pool.get()?;
        query::get_event(&conn, event_id)?.ok_or_else(|| PipelineError::not_found("event", event_id))?
    };
    events::authorize_upload(caller, &event)?;

    let mut headers = Vec::with_capacity(files.len());
    for (i, file) in files.iter().enumerate() {
        let header = inspect(&file.bytes, state.cfg.max_upload_bytes, state.cfg.min_image_dimension).map_err(|reason| {
            let name = file.filename.as_deref().unwrap_or("unnamed");
            PipelineError::Validation(format!("file {i} ({name}): {reason}"))
        })?;
        headers.push(header);
    }

    let images_dir = state.cfg.images_dir();
    let guard = BLOB_GUARD.read();
    let mut created: Vec<CreatedBlob> = Vec::new();
    let mut rows = Vec::with_capacity(files.len());
    let mut total_bytes = 0u64;
    for (file, header) in files.iter().zip(&headers) {
        let (sha256, xxh64) = content_hashes(&file.bytes);
        let ext = extension(header.format).unwrap_or("bin");
        let (path, new) = match store_blob(&images_dir, &sha256, ext, &file.bytes) {
            Ok(stored) => stored,
            Err(e) => {
                drop(guard);
                remove_unclaimed(&state.pool, &created);
                return Err(e.into());
            }
        };
        if new {
            created.push(CreatedBlob { path: path.clone(), sha256: sha256.clone(), ext });
        }
        total_bytes += file.bytes.len() as u64;
        rows.push(writer::NewImage {
            path,
            sha256,
            xxh64,
            size_bytes: file.bytes.len() as i64,
            format: ext.to_string(),
            width: header.width,
            height: header.height,
        });
    }

    let inserted = state
        .pool
        .get()
        .map_err(anyhow::Error::from)
        .and_then(|mut conn| writer::insert_batch(&mut conn, event_id, &caller.user_id, chrono::Utc::now().timestamp(), &rows));
    drop(guard);
    let (batch_id, image_ids) = match inserted {
        Ok(ids) => ids,
        Err(e) => {
            remove_unclaimed(&state.pool, &created);
            return Err(PipelineError::Internal(e.context("failed to stage batch")));
        }
    };

    let jobs = image_ids
        .into_iter()
        .zip(rows)
        .map(|(image_id, row)| DetectJob { batch_id, event_id: event_id.to_string(), image_id, path: row.path })
        .collect();
    Ok(Staged { batch_id, images: files.len(), bytes: total_bytes, jobs })
}

/// Removes blobs this call created unless a committed image row from
/// another batch now points at them.
fn remove_unclaimed(pool: &DbPool, created: &[CreatedBlob]) {
    if created.is_empty() {
        return;
    }
    let _exclusive = BLOB_GUARD.write();
    let conn = match pool.get() {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, blobs = created.len(), "could not check staged blobs, leaving them");
            return;
        }
    };
    for blob in created {
        match query::blob_referenced(&conn, &blob.sha256, blob.ext) {
            Ok(false) => {
                if let Err(e) = std::fs::remove_file(&blob.path) {
                    warn!(path = %blob.path.display(), error = %e, "could not remove staged file");
                }
            }
            Ok(true) => debug!(path = %blob.path.display(), "staged blob claimed by another batch, keeping it"),
            Err(e) => warn!(path = %blob.path.display(), error = %e, "could not check staged blob, leaving it"),
        }
    }
}

/// Accepts a batch and returns once it is durable. Detection jobs are fed
/// by a background task so the caller never waits on queue capacity.
pub async fn submit(
    state: &Arc<AppState>,
    caller: &Caller,
    event_id: &str,
    files: Vec<UploadFile>,
) -> Result<BatchHandle, PipelineError> {
    let st = state.clone();
    let c = caller.clone();
    let e = event_id.to_string();
    let staged = tokio::task::spawn_blocking(move || stage_batch(&st, &c, &e, &files)).await??;
    let batch_id = staged.batch_id;

    state.tracker.register(batch_id, event_id, staged.images as u64);
    state.stats.inc_batches_submitted();
    state.stats.inc_images_staged(staged.images as u64, staged.bytes);
    info!(batch_id, event_id, images = staged.images, bytes = staged.bytes, user_id = %caller.user_id, "batch staged");

    feed(state.clone(), batch_id, staged.jobs);
    Ok(BatchHandle { batch_id })
}

/// Enqueues detection jobs in order until done or the batch is cancelled.
pub(crate) fn feed(state: Arc<AppState>, batch_id: i64, jobs: Vec<DetectJob>) {
    tokio::spawn(async move {
        let total = jobs.len();
        for (n, job) in jobs.into_iter().enumerate() {
            if state.tracker.is_cancelled(batch_id) {
                debug!(batch_id, fed = n, total, "feeder stopped, batch cancelled");
                return;
            }
            if !enqueue(&state.queues.detect_tx, &state.gauges.detect, job).await {
                warn!(batch_id, fed = n, total, "detection queue closed");
                return;
            }
        }
        debug!(batch_id, total, "feeder done");
    });
}
