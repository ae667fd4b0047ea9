use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::models::{
    Batch, BatchCounts, BoundingBox, DecodeStatus, Embedding, FaceDetection, IndexEntry, Stage, StageCounts, StagedImage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub event_id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: i64,
}

fn event_from_row(r: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow { event_id: r.get(0)?, name: r.get(1)?, owner_id: r.get(2)?, created_at: r.get(3)? })
}

pub fn get_event(conn: &Connection, event_id: &str) -> Result<Option<EventRow>> {
    let row = conn
        .query_row(
            "SELECT event_id, name, owner_id, created_at FROM events WHERE event_id = ?1",
            params![event_id],
            event_from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn event_exists(conn: &Connection, event_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM events WHERE event_id = ?1", params![event_id], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Newest first. `None` lists every event (admin view).
pub fn list_events(conn: &Connection, owner_id: Option<&str>) -> Result<Vec<EventRow>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, name, owner_id, created_at FROM events
         WHERE ?1 IS NULL OR owner_id = ?1
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt.query_map(params![owner_id], event_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn batch_from_row(r: &Row<'_>) -> rusqlite::Result<Batch> {
    let stage: String = r.get(4)?;
    let cancelled: i64 = r.get(5)?;
    Ok(Batch {
        id: r.get(0)?,
        event_id: r.get(1)?,
        uploader_id: r.get(2)?,
        created_at: r.get(3)?,
        stage: Stage::parse(&stage).unwrap_or(Stage::Staged),
        cancelled: cancelled != 0,
        completed_at: r.get(6)?,
        gallery_link: r.get(7)?,
    })
}

const BATCH_COLUMNS: &str = "id, event_id, uploader_id, created_at, stage, cancelled, completed_at, gallery_link";

pub fn get_batch(conn: &Connection, batch_id: i64) -> Result<Option<Batch>> {
    let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1");
    let row = conn.query_row(&sql, params![batch_id], batch_from_row).optional()?;
    Ok(row)
}

/// Batches that were neither completed nor cancelled; these are the ones
/// recovered at startup.
pub fn open_batches(conn: &Connection) -> Result<Vec<Batch>> {
    let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE completed_at IS NULL AND cancelled = 0 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], batch_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Counts from the durable per-item status columns, read in one statement
/// so the numbers come from a single snapshot.
pub fn batch_counts(conn: &Connection, batch_id: i64) -> Result<BatchCounts> {
    let counts = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM images WHERE batch_id = ?1),
           (SELECT COUNT(*) FROM images WHERE batch_id = ?1 AND decode_status = 'decoded' AND failure_kind IS NULL),
           (SELECT COUNT(*) FROM images WHERE batch_id = ?1 AND failure_kind IS NOT NULL),
           (SELECT COUNT(*) FROM images WHERE batch_id = ?1 AND decode_status = 'failed'),
           (SELECT COUNT(*) FROM faces WHERE batch_id = ?1),
           (SELECT COUNT(*) FROM faces WHERE batch_id = ?1 AND embed_status = 'embedded'),
           (SELECT COUNT(*) FROM faces WHERE batch_id = ?1 AND embed_status = 'failed'),
           (SELECT COUNT(*) FROM faces WHERE batch_id = ?1 AND index_status = 'indexed'),
           (SELECT COUNT(*) FROM faces WHERE batch_id = ?1 AND index_status = 'failed')",
        params![batch_id],
        |r| {
            let n = |i: usize| -> rusqlite::Result<u64> { Ok(r.get::<_, i64>(i)?.max(0) as u64) };
            Ok(BatchCounts {
                images_total: n(0)?,
                detection: StageCounts { succeeded: n(1)?, failed: n(2)? },
                decode_failures: n(3)?,
                faces_detected: n(4)?,
                embedding: StageCounts { succeeded: n(5)?, failed: n(6)? },
                indexing: StageCounts { succeeded: n(7)?, failed: n(8)? },
            })
        },
    )?;
    Ok(counts)
}

const IMAGE_COLUMNS: &str =
    "id, batch_id, event_id, ordinal, path, sha256, xxh64, size_bytes, format, width, height, decode_status, failure_kind, face_count";

fn image_from_row(r: &Row<'_>) -> rusqlite::Result<StagedImage> {
    let path: String = r.get(4)?;
    let status: String = r.get(11)?;
    Ok(StagedImage {
        id: r.get(0)?,
        batch_id: r.get(1)?,
        event_id: r.get(2)?,
        ordinal: r.get(3)?,
        path: PathBuf::from(path),
        sha256: r.get(5)?,
        xxh64: r.get(6)?,
        size_bytes: r.get(7)?,
        format: r.get(8)?,
        width: r.get(9)?,
        height: r.get(10)?,
        decode_status: DecodeStatus::parse(&status),
        failure_kind: r.get(12)?,
        face_count: r.get(13)?,
    })
}

pub fn get_image(conn: &Connection, image_id: i64) -> Result<Option<StagedImage>> {
    let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1");
    let row = conn.query_row(&sql, params![image_id], image_from_row).optional()?;
    Ok(row)
}

pub fn batch_images(conn: &Connection, batch_id: i64) -> Result<Vec<StagedImage>> {
    let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE batch_id = ?1 ORDER BY ordinal");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![batch_id], image_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// True when a committed image row points at the blob `sha256.format`.
pub fn blob_referenced(conn: &Connection, sha256: &str, format: &str) -> Result<bool> {
    let found = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM images WHERE sha256 = ?1 AND format = ?2)",
        params![sha256, format],
        |r| r.get::<_, bool>(0),
    )?;
    Ok(found)
}

/// Images whose detection never committed, or whose faces still have
/// embedding/indexing outstanding.
pub fn unfinished_images(conn: &Connection, batch_id: i64) -> Result<Vec<StagedImage>> {
    let sql = format!(
        "SELECT {IMAGE_COLUMNS} FROM images i
         WHERE i.batch_id = ?1 AND (
           i.decode_status = 'pending'
           OR (i.failure_kind IS NULL AND EXISTS (
                 SELECT 1 FROM faces f WHERE f.image_id = i.id
                 AND f.embed_status != 'failed' AND f.index_status NOT IN ('indexed', 'failed'))))
         ORDER BY i.ordinal"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![batch_id], image_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn batch_faces(conn: &Connection, batch_id: i64) -> Result<Vec<FaceDetection>> {
    let mut stmt = conn.prepare(
        "SELECT id, image_id, ordinal, x, y, w, h, confidence FROM faces WHERE batch_id = ?1 ORDER BY image_id, ordinal",
    )?;
    let rows = stmt.query_map(params![batch_id], |r| {
        let confidence: f64 = r.get(7)?;
        Ok(FaceDetection {
            face_id: r.get(0)?,
            image_id: r.get(1)?,
            ordinal: r.get(2)?,
            bbox: BoundingBox { x: r.get(3)?, y: r.get(4)?, w: r.get(5)?, h: r.get(6)? },
            confidence: confidence as f32,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_embedding(conn: &Connection, face_id: i64) -> Result<Option<Embedding>> {
    let row: Option<(String, Vec<u8>)> = conn
        .query_row(
            "SELECT model_version, vector FROM embeddings WHERE face_id = ?1",
            params![face_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        Some((model_version, blob)) => Ok(Some(Embedding { face_id, vector: decode_embedding_blob(&blob)?, model_version })),
        None => Ok(None),
    }
}

pub fn load_index_entries(conn: &Connection) -> Result<Vec<IndexEntry>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, face_id, image_id, model_version, vector FROM index_entries ORDER BY face_id",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?, r.get::<_, String>(3)?, r.get::<_, Vec<u8>>(4)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (event_id, face_id, image_id, model_version, blob) = row?;
        out.push(IndexEntry { event_id, face_id, image_id, embedding: decode_embedding_blob(&blob)?, model_version });
    }
    Ok(out)
}

pub fn get_index_meta(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM index_meta")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
}

pub fn decode_embedding_blob(blob: &[u8]) -> Result<Vec<f32>> {
    // Convert bytes back to f32 (little-endian)
    if blob.len() % 4 != 0 {
        anyhow::bail!("Embedding blob length is not a multiple of 4");
    }
    let mut embeddings = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        let bytes: [u8; 4] = [chunk[0], chunk[1], chunk[2], chunk[3]];
        embeddings.push(f32::from_le_bytes(bytes));
    }
    Ok(embeddings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{schema, writer};
    use crate::error::ItemFailure;
    use crate::models::{Event, FaceCandidate};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::apply_schema(&conn).unwrap();
        conn
    }

    fn image(n: u8) -> writer::NewImage {
        writer::NewImage {
            path: PathBuf::from(format!("/tmp/{n}.png")),
            sha256: format!("{n:02x}"),
            xxh64: 0,
            size_bytes: 10,
            format: "png".into(),
            width: 40,
            height: 40,
        }
    }

    #[test]
    fn events_listed_newest_first_per_owner() {
        let c = conn();
        for (id, owner, at) in [("a", "p1", 1), ("b", "p1", 3), ("c", "p2", 2)] {
            let ev = Event { event_id: id.into(), name: id.into(), owner_id: owner.into(), created_at: at, share_link: String::new() };
            writer::insert_event(&c, &ev).unwrap();
        }
        let mine: Vec<String> = list_events(&c, Some("p1")).unwrap().into_iter().map(|e| e.event_id).collect();
        assert_eq!(mine, vec!["b", "a"]);
        assert_eq!(list_events(&c, None).unwrap().len(), 3);
        assert!(event_exists(&c, "c").unwrap());
        assert!(!event_exists(&c, "zzz").unwrap());
    }

    #[test]
    fn counts_track_item_status() {
        let mut c = conn();
        let (batch_id, ids) = writer::insert_batch(&mut c, "e", "u", 0, &[image(1), image(2), image(3)]).unwrap();
        let cand = FaceCandidate { bbox: BoundingBox { x: 0, y: 0, w: 20, h: 20 }, confidence: 0.9 };
        let rec = writer::record_detections(&mut c, ids[0], batch_id, "d", &[cand]).unwrap();
        writer::mark_image_failed(&c, ids[1], &ItemFailure::Decode("truncated".into())).unwrap();
        writer::mark_image_failed(&c, ids[2], &ItemFailure::Detection("model".into())).unwrap();
        let emb = Embedding { face_id: rec.faces[0].detection.face_id, vector: vec![0.5, 0.5], model_version: "m".into() };
        writer::store_embedding(&mut c, &emb).unwrap();

        let counts = batch_counts(&c, batch_id).unwrap();
        assert_eq!(counts.images_total, 3);
        assert_eq!(counts.detection, StageCounts { succeeded: 1, failed: 2 });
        assert_eq!(counts.decode_failures, 1);
        assert_eq!(counts.faces_detected, 1);
        assert_eq!(counts.embedding.succeeded, 1);
        assert_eq!(counts.indexing.done(), 0);
        assert!(!counts.is_complete());

        let unfinished = unfinished_images(&c, batch_id).unwrap();
        assert_eq!(unfinished.iter().map(|i| i.id).collect::<Vec<_>>(), vec![ids[0]]);
        assert_eq!(get_embedding(&c, emb.face_id).unwrap().unwrap().vector, vec![0.5, 0.5]);
    }

    #[test]
    fn embedding_blob_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding_blob(&writer::encode_embedding(&v)).unwrap(), v);
        assert!(decode_embedding_blob(&[1, 2, 3]).is_err());
    }
}
