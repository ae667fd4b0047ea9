use anyhow::Result;
use rusqlite::Connection;

pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268435456i64)?;
    conn.pragma_update(None, "page_size", 4096i64)?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  owner_id TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_owner ON events(owner_id, created_at);

CREATE TABLE IF NOT EXISTS batches (
  id INTEGER PRIMARY KEY,
  event_id TEXT NOT NULL,
  uploader_id TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  stage TEXT NOT NULL DEFAULT 'staged',
  cancelled INTEGER NOT NULL DEFAULT 0,
  completed_at INTEGER,
  gallery_link TEXT
);

CREATE INDEX IF NOT EXISTS idx_batches_open ON batches(completed_at, cancelled);

CREATE TABLE IF NOT EXISTS images (
  id INTEGER PRIMARY KEY,
  batch_id INTEGER NOT NULL,
  event_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  path TEXT NOT NULL,
  sha256 TEXT NOT NULL,
  xxh64 INTEGER NOT NULL,
  size_bytes INTEGER NOT NULL,
  format TEXT NOT NULL,
  width INTEGER NOT NULL,
  height INTEGER NOT NULL,
  decode_status TEXT NOT NULL DEFAULT 'pending',
  failure_kind TEXT,
  failure_detail TEXT,
  face_count INTEGER NOT NULL DEFAULT 0,
  UNIQUE(batch_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_images_batch ON images(batch_id, decode_status);
CREATE INDEX IF NOT EXISTS idx_images_hash ON images(sha256);

CREATE TABLE IF NOT EXISTS faces (
  id INTEGER PRIMARY KEY,
  image_id INTEGER NOT NULL,
  batch_id INTEGER NOT NULL,
  ordinal INTEGER NOT NULL,
  x INTEGER NOT NULL,
  y INTEGER NOT NULL,
  w INTEGER NOT NULL,
  h INTEGER NOT NULL,
  confidence REAL NOT NULL,
  model_version TEXT NOT NULL,
  embed_status TEXT NOT NULL DEFAULT 'pending',
  index_status TEXT NOT NULL DEFAULT 'pending',
  failure TEXT,
  UNIQUE(image_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_faces_batch ON faces(batch_id);

CREATE TABLE IF NOT EXISTS embeddings (
  face_id INTEGER PRIMARY KEY,
  model_version TEXT NOT NULL,
  dim INTEGER NOT NULL,
  vector BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS index_entries (
  face_id INTEGER PRIMARY KEY,
  event_id TEXT NOT NULL,
  image_id INTEGER NOT NULL,
  model_version TEXT NOT NULL,
  vector BLOB NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_index_entries_event ON index_entries(event_id);

CREATE TABLE IF NOT EXISTS index_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
    )?;
    Ok(())
}
