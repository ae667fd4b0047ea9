use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::PathBuf;

use crate::error::ItemFailure;
use crate::models::{DecodeStatus, Embedding, Event, FaceCandidate, FaceDetection, IndexEntry, Stage};

/// An accepted upload, hashed and written to the content store, waiting for
/// its row.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub path: PathBuf,
    pub sha256: String,
    pub xxh64: i64,
    pub size_bytes: i64,
    pub format: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct RecordedFace {
    pub detection: FaceDetection,
    /// False once the face reached a terminal embed/index status.
    pub needs_work: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordedDetections {
    pub faces: Vec<RecordedFace>,
    pub removed_face_ids: Vec<i64>,
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events (event_id, name, owner_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![event.event_id, event.name, event.owner_id, event.created_at],
    )?;
    Ok(())
}

/// Batch row plus every image row in one transaction; either the whole
/// batch becomes visible or none of it does.
pub fn insert_batch(
    conn: &mut Connection,
    event_id: &str,
    uploader_id: &str,
    created_at: i64,
    images: &[NewImage],
) -> Result<(i64, Vec<i64>)> {
    let tx = conn.transaction()?;
    let batch_id: i64 = tx.query_row(
        "INSERT INTO batches (event_id, uploader_id, created_at, stage) VALUES (?1, ?2, ?3, ?4) RETURNING id",
        params![event_id, uploader_id, created_at, Stage::Staged.as_str()],
        |r| r.get(0),
    )?;
    let mut image_ids = Vec::with_capacity(images.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO images (batch_id, event_id, ordinal, path, sha256, xxh64, size_bytes, format, width, height, decode_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) RETURNING id",
        )?;
        for (ordinal, img) in images.iter().enumerate() {
            let id: i64 = stmt.query_row(
                params![
                    batch_id,
                    event_id,
                    ordinal as i64,
                    img.path.to_string_lossy(),
                    img.sha256,
                    img.xxh64,
                    img.size_bytes,
                    img.format,
                    img.width,
                    img.height,
                    DecodeStatus::Pending.as_str(),
                ],
                |r| r.get(0),
            )?;
            image_ids.push(id);
        }
    }
    tx.commit()?;
    Ok((batch_id, image_ids))
}

/// Upserts the kept detections of one image onto `(image_id, ordinal)` and
/// marks the image decoded, in one transaction. Existing embed/index status
/// survives a rerun so recovery does not redo finished faces.
pub fn record_detections(
    conn: &mut Connection,
    image_id: i64,
    batch_id: i64,
    model_version: &str,
    faces: &[FaceCandidate],
) -> Result<RecordedDetections> {
    let tx = conn.transaction()?;
    let mut out = RecordedDetections::default();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO faces (image_id, batch_id, ordinal, x, y, w, h, confidence, model_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(image_id, ordinal) DO UPDATE SET
               x = excluded.x, y = excluded.y, w = excluded.w, h = excluded.h,
               confidence = excluded.confidence, model_version = excluded.model_version
             RETURNING id, embed_status, index_status",
        )?;
        for (ordinal, face) in faces.iter().enumerate() {
            let (face_id, embed_status, index_status): (i64, String, String) = stmt.query_row(
                params![
                    image_id,
                    batch_id,
                    ordinal as i64,
                    face.bbox.x,
                    face.bbox.y,
                    face.bbox.w,
                    face.bbox.h,
                    face.confidence as f64,
                    model_version,
                ],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?;
            let finished = embed_status == "failed" || index_status == "indexed" || index_status == "failed";
            out.faces.push(RecordedFace {
                detection: FaceDetection {
                    face_id,
                    image_id,
                    ordinal: ordinal as i64,
                    bbox: face.bbox,
                    confidence: face.confidence,
                },
                needs_work: !finished,
            });
        }
    }

    let stale: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM faces WHERE image_id = ?1 AND ordinal >= ?2")?;
        let rows = stmt.query_map(params![image_id, faces.len() as i64], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()?
    };
    for face_id in &stale {
        tx.execute("DELETE FROM index_entries WHERE face_id = ?1", params![face_id])?;
        tx.execute("DELETE FROM embeddings WHERE face_id = ?1", params![face_id])?;
        tx.execute("DELETE FROM faces WHERE id = ?1", params![face_id])?;
    }
    out.removed_face_ids = stale;

    tx.execute(
        "UPDATE images SET decode_status = ?2, face_count = ?3, failure_kind = NULL, failure_detail = NULL WHERE id = ?1",
        params![image_id, DecodeStatus::Decoded.as_str(), faces.len() as i64],
    )?;
    tx.commit()?;
    Ok(out)
}

pub fn mark_image_failed(conn: &Connection, image_id: i64, failure: &ItemFailure) -> Result<()> {
    let status = match failure {
        ItemFailure::Decode(_) => DecodeStatus::Failed,
        _ => DecodeStatus::Decoded,
    };
    conn.execute(
        "UPDATE images SET decode_status = ?2, failure_kind = ?3, failure_detail = ?4, face_count = 0 WHERE id = ?1",
        params![image_id, status.as_str(), failure.kind(), failure.to_string()],
    )
    .with_context(|| format!("failed to record failure for image {image_id}"))?;
    Ok(())
}

pub fn store_embedding(conn: &mut Connection, embedding: &Embedding) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO embeddings (face_id, model_version, dim, vector) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(face_id) DO UPDATE SET model_version = excluded.model_version, dim = excluded.dim, vector = excluded.vector",
        params![
            embedding.face_id,
            embedding.model_version,
            embedding.vector.len() as i64,
            encode_embedding(&embedding.vector),
        ],
    )?;
    tx.execute(
        "UPDATE faces SET embed_status = 'embedded', failure = NULL WHERE id = ?1",
        params![embedding.face_id],
    )?;
    tx.commit()?;
    Ok(())
}

/// A face that cannot be embedded is excluded from indexing for good.
pub fn mark_face_embed_failed(conn: &Connection, face_id: i64, failure: &ItemFailure) -> Result<()> {
    conn.execute(
        "UPDATE faces SET embed_status = 'failed', index_status = 'skipped', failure = ?2 WHERE id = ?1",
        params![face_id, failure.kind()],
    )?;
    Ok(())
}

/// Durable half of an index upsert. The entry row and the face's index
/// status commit together.
pub fn upsert_index_entry(conn: &mut Connection, entry: &IndexEntry, updated_at: i64) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO index_entries (face_id, event_id, image_id, model_version, vector, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(face_id) DO UPDATE SET
           event_id = excluded.event_id, image_id = excluded.image_id,
           model_version = excluded.model_version, vector = excluded.vector, updated_at = excluded.updated_at",
        params![
            entry.face_id,
            entry.event_id,
            entry.image_id,
            entry.model_version,
            encode_embedding(&entry.embedding),
            updated_at,
        ],
    )?;
    tx.execute("UPDATE faces SET index_status = 'indexed' WHERE id = ?1", params![entry.face_id])?;
    tx.commit()?;
    Ok(())
}

pub fn mark_face_index_failed(conn: &Connection, face_id: i64, failure: &ItemFailure) -> Result<()> {
    conn.execute(
        "UPDATE faces SET index_status = 'failed', failure = ?2 WHERE id = ?1",
        params![face_id, failure.kind()],
    )?;
    Ok(())
}

const STAGE_RANK_SQL: &str = "CASE stage WHEN 'staged' THEN 0 WHEN 'detecting' THEN 1 \
     WHEN 'embedding' THEN 2 WHEN 'indexing' THEN 3 ELSE 4 END";

fn stage_rank(stage: Stage) -> i64 {
    match stage {
        Stage::Staged => 0,
        Stage::Detecting => 1,
        Stage::Embedding => 2,
        Stage::Indexing => 3,
        Stage::Complete | Stage::Cancelled => 4,
    }
}

/// Moves an open batch forward. Writes that would move it back are
/// dropped, so out-of-order callers cannot regress the stored stage.
pub fn set_batch_stage(conn: &Connection, batch_id: i64, stage: Stage) -> Result<bool> {
    let sql = format!("UPDATE batches SET stage = ?2 WHERE id = ?1 AND completed_at IS NULL AND {STAGE_RANK_SQL} < ?3");
    let n = conn.execute(&sql, params![batch_id, stage.as_str(), stage_rank(stage)])?;
    Ok(n > 0)
}

/// Returns false when the batch was already terminal.
pub fn complete_batch(conn: &Connection, batch_id: i64, gallery_link: &str, completed_at: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE batches SET stage = 'complete', gallery_link = ?2, completed_at = ?3
         WHERE id = ?1 AND cancelled = 0 AND completed_at IS NULL",
        params![batch_id, gallery_link, completed_at],
    )?;
    Ok(n > 0)
}

/// Returns false when the batch was already terminal.
pub fn cancel_batch(conn: &Connection, batch_id: i64, cancelled_at: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE batches SET stage = 'cancelled', cancelled = 1, completed_at = ?2
         WHERE id = ?1 AND completed_at IS NULL",
        params![batch_id, cancelled_at],
    )?;
    Ok(n > 0)
}

/// Drops batch rows that reached a terminal state before `cutoff`. Images,
/// faces and index entries stay; galleries still point at them.
pub fn delete_expired_batches(conn: &Connection, cutoff: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "DELETE FROM batches WHERE completed_at IS NOT NULL AND completed_at < ?1 RETURNING id",
    )?;
    let rows = stmt.query_map(params![cutoff], |r| r.get(0))?;
    let ids = rows.collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

pub fn put_index_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO index_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
