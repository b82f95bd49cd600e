//! The `Records` manifest table and its schema migration (spec §4.2).
//!
//! All functions here are synchronous and take a `&Connection` directly;
//! callers run them inside `spawn_blocking` (see `disk::mod`). Kept free of
//! async so this module can be exercised with plain `#[test]`s.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CacheResult;

/// A manifest row, loaded for reads and trim decisions.
pub struct Record {
    pub filename: Option<String>,
    pub inline_value: Option<Vec<u8>>,
    pub size: u64,
    pub expire_at: Option<f64>,
}

/// Creates the schema if absent and adds any columns a prior version of
/// this crate might be missing (spec §4.2 "Schema migration").
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            key TEXT PRIMARY KEY,
            filename TEXT NULL,
            size INTEGER NOT NULL,
            last_access_time REAL NOT NULL,
            last_modified_time REAL NOT NULL,
            inline_value BLOB NULL,
            expire_at REAL NULL,
            extended BLOB NULL
        );
        CREATE INDEX IF NOT EXISTS records_last_access_time ON records(last_access_time);",
    )?;

    let mut existing = std::collections::HashSet::new();
    let mut stmt = conn.prepare("PRAGMA table_info(records)")?;
    let cols = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for col in cols {
        existing.insert(col?);
    }
    drop(stmt);

    if !existing.contains("expire_at") {
        conn.execute("ALTER TABLE records ADD COLUMN expire_at REAL NULL", [])?;
    }
    if !existing.contains("extended") {
        conn.execute("ALTER TABLE records ADD COLUMN extended BLOB NULL", [])?;
    }
    Ok(())
}

/// WAL mode, normal durability, and a periodic checkpoint threshold (spec §6.4).
pub fn configure_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    Ok(())
}

pub fn select_record(conn: &Connection, key: &str) -> rusqlite::Result<Option<Record>> {
    conn.query_row(
        "SELECT filename, inline_value, size, expire_at FROM records WHERE key = ?1",
        params![key],
        |row| {
            Ok(Record {
                filename: row.get(0)?,
                inline_value: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
                expire_at: row.get(3)?,
            })
        },
    )
    .optional()
}

pub fn touch_access_time(conn: &Connection, key: &str, now: f64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE records SET last_access_time = ?1 WHERE key = ?2",
        params![now, key],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn upsert_record(
    conn: &Connection,
    key: &str,
    size: u64,
    now: f64,
    expire_at: Option<f64>,
    inline_value: Option<&[u8]>,
    filename: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO records
            (key, filename, size, last_access_time, last_modified_time, inline_value, expire_at, extended)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, NULL)",
        params![key, filename, size as i64, now, inline_value, expire_at],
    )?;
    Ok(())
}

/// Deletes the row for `key`, returning its sidecar filename if it had one.
pub fn delete_record(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    let filename: Option<String> = conn
        .query_row(
            "SELECT filename FROM records WHERE key = ?1",
            params![key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten();
    conn.execute("DELETE FROM records WHERE key = ?1", params![key])?;
    Ok(filename)
}

pub fn clear_all(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM records", [])?;
    conn.execute_batch("VACUUM")?;
    Ok(())
}

pub fn count(conn: &Connection) -> rusqlite::Result<u64> {
    conn.query_row("SELECT COUNT(*) FROM records", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|n| n as u64)
}

pub fn total_size(conn: &Connection) -> rusqlite::Result<u64> {
    conn.query_row("SELECT COALESCE(SUM(size), 0) FROM records", [], |row| {
        row.get::<_, i64>(0)
    })
    .map(|n| n as u64)
}

pub fn contains(conn: &Connection, key: &str, now: f64) -> rusqlite::Result<bool> {
    let expire_at: Option<Option<f64>> = conn
        .query_row(
            "SELECT expire_at FROM records WHERE key = ?1",
            params![key],
            |row| row.get::<_, Option<f64>>(0),
        )
        .optional()?;
    Ok(match expire_at {
        None => false,
        Some(Some(t)) => t > now,
        Some(None) => true,
    })
}

/// One evicted row, carried out of a trim pass so the caller can remove the
/// matching sidecar file and report bytes to metrics.
pub struct Evicted {
    pub filename: Option<String>,
    pub size: u64,
}

fn delete_rows(conn: &Connection, keys: &[String]) -> rusqlite::Result<Vec<Evicted>> {
    let mut evicted = Vec::with_capacity(keys.len());
    for key in keys {
        let row: Option<(Option<String>, i64)> = conn
            .query_row(
                "SELECT filename, size FROM records WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((filename, size)) = row {
            conn.execute("DELETE FROM records WHERE key = ?1", params![key])?;
            evicted.push(Evicted {
                filename,
                size: size as u64,
            });
        }
    }
    Ok(evicted)
}

/// TTL pass: up to 512 expired rows (spec §4.2 trim pass 1).
pub fn trim_ttl(conn: &Connection, now: f64) -> rusqlite::Result<Vec<Evicted>> {
    let mut stmt = conn.prepare(
        "SELECT key FROM records WHERE expire_at IS NOT NULL AND expire_at <= ?1 LIMIT 512",
    )?;
    let keys = stmt
        .query_map(params![now], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    delete_rows(conn, &keys)
}

/// Age pass: up to 256 idle rows (spec §4.2 trim pass 2).
pub fn trim_age(conn: &Connection, cutoff: f64) -> rusqlite::Result<Vec<Evicted>> {
    let mut stmt = conn.prepare(
        "SELECT key FROM records WHERE last_access_time <= ?1 ORDER BY last_access_time ASC LIMIT 256",
    )?;
    let keys = stmt
        .query_map(params![cutoff], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    delete_rows(conn, &keys)
}

/// Count pass: oldest-first rows beyond `count_limit` (spec §4.2 trim pass 3).
pub fn trim_count(conn: &Connection, count_limit: u64) -> rusqlite::Result<Vec<Evicted>> {
    let current = count(conn)?;
    if current <= count_limit {
        return Ok(Vec::new());
    }
    let excess = current - count_limit;
    let mut stmt = conn.prepare(
        "SELECT key FROM records ORDER BY last_access_time ASC LIMIT ?1",
    )?;
    let keys = stmt
        .query_map(params![excess as i64], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    delete_rows(conn, &keys)
}

/// Size pass: oldest-first rows until the overage is covered (spec §4.2 trim pass 4).
pub fn trim_size(conn: &Connection, byte_limit: u64) -> rusqlite::Result<Vec<Evicted>> {
    let current = total_size(conn)?;
    if current <= byte_limit {
        return Ok(Vec::new());
    }
    let mut overage = current - byte_limit;
    let mut stmt =
        conn.prepare("SELECT key, size FROM records ORDER BY last_access_time ASC")?;
    let mut rows = stmt.query(params![])?;
    let mut keys = Vec::new();
    while overage > 0 {
        let Some(row) = rows.next()? else { break };
        let key: String = row.get(0)?;
        let size: i64 = row.get(1)?;
        keys.push(key);
        overage = overage.saturating_sub(size as u64);
    }
    drop(rows);
    drop(stmt);
    delete_rows(conn, &keys)
}

/// Loads every `(key, size)` pair; used only by tests and scenario checks.
#[cfg(test)]
pub fn all_keys(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT key FROM records ORDER BY last_access_time ASC")?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}

pub fn to_cache_result<T>(r: rusqlite::Result<T>) -> CacheResult<T> {
    r.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn schema_migration_adds_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE records (
                key TEXT PRIMARY KEY, filename TEXT NULL, size INTEGER NOT NULL,
                last_access_time REAL NOT NULL, last_modified_time REAL NOT NULL,
                inline_value BLOB NULL
            );",
        )
        .unwrap();
        init_schema(&conn).unwrap();
        upsert_record(&conn, "k", 3, 1.0, Some(2.0), Some(b"abc"), None).unwrap();
        let rec = select_record(&conn, "k").unwrap().unwrap();
        assert_eq!(rec.expire_at, Some(2.0));
    }

    #[test]
    fn upsert_select_delete_round_trip() {
        let conn = conn();
        upsert_record(&conn, "k", 3, 10.0, None, Some(b"abc"), None).unwrap();
        let rec = select_record(&conn, "k").unwrap().unwrap();
        assert_eq!(rec.inline_value.as_deref(), Some(&b"abc"[..]));
        assert_eq!(rec.filename, None);

        let removed_filename = delete_record(&conn, "k").unwrap();
        assert_eq!(removed_filename, None);
        assert!(select_record(&conn, "k").unwrap().is_none());
    }

    #[test]
    fn trim_count_evicts_oldest_first() {
        let conn = conn();
        upsert_record(&conn, "a", 1, 1.0, None, Some(b"x"), None).unwrap();
        upsert_record(&conn, "b", 1, 2.0, None, Some(b"x"), None).unwrap();
        upsert_record(&conn, "c", 1, 3.0, None, Some(b"x"), None).unwrap();

        let evicted = trim_count(&conn, 2).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(all_keys(&conn).unwrap(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn trim_size_evicts_until_under_budget() {
        let conn = conn();
        upsert_record(&conn, "a", 1000, 1.0, None, Some(&vec![0u8; 1000]), None).unwrap();
        upsert_record(&conn, "b", 1000, 2.0, None, Some(&vec![0u8; 1000]), None).unwrap();
        upsert_record(&conn, "c", 1000, 3.0, None, Some(&vec![0u8; 1000]), None).unwrap();

        let evicted = trim_size(&conn, 1500).unwrap();
        assert_eq!(evicted.len(), 2);
        assert_eq!(all_keys(&conn).unwrap(), vec!["c".to_string()]);
    }

    #[test]
    fn trim_ttl_evicts_only_expired() {
        let conn = conn();
        upsert_record(&conn, "expired", 1, 1.0, Some(5.0), Some(b"x"), None).unwrap();
        upsert_record(&conn, "alive", 1, 1.0, Some(50.0), Some(b"x"), None).unwrap();

        let evicted = trim_ttl(&conn, 10.0).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(all_keys(&conn).unwrap(), vec!["alive".to_string()]);
    }
}
