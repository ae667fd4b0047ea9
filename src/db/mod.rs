pub mod schema;
pub mod writer;
pub mod query;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

pub fn open_or_create<P: AsRef<Path>>(db_path: P) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    schema::apply_pragmas(&conn)?;
    schema::apply_schema(&conn)?;
    Ok(conn)
}

/// Pooled connections share the WAL database; every checkout gets the same
/// pragmas and a busy timeout so concurrent stage writers wait instead of
/// failing with SQLITE_BUSY.
pub fn create_pool<P: AsRef<Path>>(db_path: P, max_size: u32) -> Result<DbPool> {
    // Schema first on a plain connection so pool init never races DDL.
    drop(open_or_create(db_path.as_ref()).context("failed to open database")?);

    let manager = SqliteConnectionManager::file(db_path.as_ref()).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    });
    let pool = r2d2::Pool::builder()
        .max_size(max_size)
        .build(manager)
        .context("failed to build connection pool")?;
    Ok(pool)
}
