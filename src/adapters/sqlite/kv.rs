//! Key/value entries (history cursors, cached thread snapshots)

use rusqlite::{params, OptionalExtension};

use super::DbPool;
use crate::error::Result;

pub fn get(pool: &DbPool, key: &str) -> Result<Option<String>> {
    let conn = pool.get()?;
    let value = conn
        .query_row(
            "SELECT value FROM kv_entries WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn put(pool: &DbPool, key: &str, value: &str) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

pub fn delete(pool: &DbPool, key: &str) -> Result<bool> {
    let conn = pool.get()?;
    let removed = conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
    Ok(removed > 0)
}

/// Keys starting with `prefix`, in key order.
pub fn list(pool: &DbPool, prefix: &str) -> Result<Vec<String>> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT key FROM kv_entries WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
    let keys = stmt
        .query_map(params![prefix, prefix.chars().count() as i64], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool;

    #[test]
    fn test_put_get_overwrite_delete() {
        let pool = pool::in_memory().expect("pool");
        assert_eq!(get(&pool, "a").unwrap(), None);

        put(&pool, "a", "1").unwrap();
        put(&pool, "a", "2").unwrap();
        assert_eq!(get(&pool, "a").unwrap().as_deref(), Some("2"));

        assert!(delete(&pool, "a").unwrap());
        assert!(!delete(&pool, "a").unwrap());
    }

    #[test]
    fn test_list_by_prefix_ignores_like_wildcards() {
        let pool = pool::in_memory().expect("pool");
        put(&pool, "thread:c_1:a", "{}").unwrap();
        put(&pool, "thread:c_1:b", "{}").unwrap();
        put(&pool, "thread:cx1:a", "{}").unwrap();
        put(&pool, "history_cursor:c_1", "10").unwrap();

        let keys = list(&pool, "thread:c_1:").unwrap();
        assert_eq!(keys, vec!["thread:c_1:a", "thread:c_1:b"]);
    }
}
