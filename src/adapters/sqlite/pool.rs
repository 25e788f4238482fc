use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use crate::error::{FlowError, Result};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open (creating if needed) the database file and bring the schema up.
pub fn open(db_path: &Path, max_size: u32) -> Result<DbPool> {
    if let Some(dir) = db_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|e| {
                FlowError::Database(format!("Failed to create database dir: {e}"))
            })?;
        }
    }

    let pool = create_pool(db_path, max_size)?;
    let conn = pool.get()?;
    super::schema::initialize_schema(&conn)?;
    Ok(pool)
}

fn create_pool(db_path: &Path, max_size: u32) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
    });

    let pool = Pool::builder().max_size(max_size.max(1)).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;",
    )?;

    Ok(pool)
}

/// Single-connection in-memory database. Every pooled in-memory connection
/// would be its own database, hence `max_size(1)`.
pub fn in_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    super::schema::initialize_schema(&conn)?;
    Ok(pool)
}
