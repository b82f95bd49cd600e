//! The on-disk manifest tier (spec §4.2).
//!
//! Structured as a dedicated actor task that owns a single `rusqlite`
//! connection, grounded on the teacher's `database::connection` pooled
//! connection lifecycle (open → health/schema check → serialized use →
//! graceful shutdown). Unlike the teacher's pool, there is exactly one
//! connection and exactly one task using it — every `DiskCommand` is
//! processed to completion before the next is taken off the channel, which
//! is what gives this tier its actor semantics (spec §5).

mod manifest;
mod sidecar;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::{DiskConfig, StorageMode};
use crate::error::{CacheError, CacheResult};
use crate::metrics::Metrics;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

enum Command {
    Read {
        key: String,
        reply: oneshot::Sender<CacheResult<Option<Vec<u8>>>>,
    },
    Write {
        key: String,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
        reply: oneshot::Sender<CacheResult<()>>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<CacheResult<()>>,
    },
    Contains {
        key: String,
        reply: oneshot::Sender<CacheResult<bool>>,
    },
    Clear {
        reply: oneshot::Sender<CacheResult<()>>,
    },
}

/// Durable, manifest-backed tier: a SQLite database of record metadata plus
/// sidecar files for large blobs.
pub struct DiskTier {
    cmd_tx: mpsc::Sender<Command>,
    _worker: tokio::task::JoinHandle<()>,
}

impl DiskTier {
    /// Opens (creating if absent) the manifest database and data directory
    /// under `base_dir/name/`, and spawns the owning actor task.
    pub async fn open(
        base_dir: PathBuf,
        name: &str,
        config: DiskConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> CacheResult<Self> {
        let root = base_dir.join(name);
        let data_dir = root.join("data");
        let db_path = root.join("manifest.sqlite3");

        let root_for_setup = root.clone();
        let data_dir_for_setup = data_dir.clone();
        let db_path_for_setup = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || -> CacheResult<Connection> {
            std::fs::create_dir_all(&root_for_setup)?;
            std::fs::create_dir_all(&data_dir_for_setup)?;
            sidecar::exclude_from_backup(&root_for_setup);
            let conn = Connection::open(&db_path_for_setup)?;
            manifest::configure_pragmas(&conn)?;
            manifest::init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| CacheError::Store(e.to_string()))??;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let worker = tokio::spawn(run_actor(conn, data_dir, config, metrics, cmd_rx));

        Ok(Self {
            cmd_tx,
            _worker: worker,
        })
    }

    pub async fn read(&self, key: String) -> CacheResult<Option<Vec<u8>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Read { key, reply }).await?;
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    pub async fn write(&self, key: String, bytes: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Write {
            key,
            bytes,
            ttl,
            reply,
        })
        .await?;
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    pub async fn remove(&self, key: String) -> CacheResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Remove { key, reply }).await?;
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    pub async fn contains(&self, key: String) -> CacheResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Contains { key, reply }).await?;
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    pub async fn clear(&self) -> CacheResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Clear { reply }).await?;
        rx.await.map_err(|_| CacheError::Cancelled)?
    }

    async fn send(&self, cmd: Command) -> CacheResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| CacheError::Store("disk tier worker has shut down".into()))
    }
}

impl Drop for DiskTier {
    fn drop(&mut self) {
        self._worker.abort();
    }
}

async fn run_actor(
    mut conn: Connection,
    data_dir: PathBuf,
    config: DiskConfig,
    metrics: Option<Arc<Metrics>>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let mut ticker = tokio::time::interval(config.auto_trim_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let auto_trim_enabled = !config.auto_trim_interval.is_zero();

    loop {
        tokio::select! {
            biased;
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                conn = handle_command(conn, &data_dir, &config, &metrics, cmd).await;
            }
            _ = ticker.tick(), if auto_trim_enabled => {
                conn = run_trim(conn, &data_dir, &config, &metrics).await;
            }
        }
    }
}

async fn handle_command(
    conn: Connection,
    data_dir: &PathBuf,
    config: &DiskConfig,
    metrics: &Option<Arc<Metrics>>,
    cmd: Command,
) -> Connection {
    match cmd {
        Command::Read { key, reply } => {
            let data_dir = data_dir.clone();
            let (conn, result) = blocking(conn, move |conn| do_read(conn, &data_dir, &key)).await;
            if let Ok(Some(bytes)) = &result {
                if let Some(m) = metrics {
                    m.record_disk_hit(bytes.len() as u64);
                }
            } else if let Ok(None) = &result {
                if let Some(m) = metrics {
                    m.record_disk_miss();
                }
            }
            let _ = reply.send(result);
            conn
        }
        Command::Write {
            key,
            bytes,
            ttl,
            reply,
        } => {
            let write_data_dir = data_dir.clone();
            let storage_mode = config.storage_mode;
            let inline_threshold = config.inline_threshold_bytes;
            let len = bytes.len() as u64;
            let (conn, result) = blocking(conn, move |conn| {
                do_write(conn, &write_data_dir, &key, &bytes, ttl, storage_mode, inline_threshold)
            })
            .await;
            if result.is_ok() {
                if let Some(m) = metrics {
                    m.record_write_bytes(len);
                }
            } else if let Err(e) = &result {
                warn!(error = %e, "disk tier write failed");
            }
            let _ = reply.send(result);
            run_trim(conn, data_dir, config, metrics).await
        }
        Command::Remove { key, reply } => {
            let data_dir = data_dir.clone();
            let (conn, result) = blocking(conn, move |conn| do_remove(conn, &data_dir, &key)).await;
            let _ = reply.send(result);
            conn
        }
        Command::Contains { key, reply } => {
            let (conn, result) = blocking(conn, move |conn| {
                manifest::to_cache_result(manifest::contains(conn, &key, now_secs()))
            })
            .await;
            let _ = reply.send(result);
            conn
        }
        Command::Clear { reply } => {
            let data_dir = data_dir.clone();
            let (conn, result) = blocking(conn, move |conn| do_clear(conn, &data_dir)).await;
            let _ = reply.send(result);
            conn
        }
    }
}

fn do_read(conn: &Connection, data_dir: &PathBuf, key: &str) -> CacheResult<Option<Vec<u8>>> {
    let now = now_secs();
    let Some(record) = manifest::to_cache_result(manifest::select_record(conn, key))? else {
        return Ok(None);
    };
    if matches!(record.expire_at, Some(t) if t <= now) {
        manifest::to_cache_result(manifest::delete_record(conn, key))?;
        if let Some(filename) = record.filename {
            let _ = sidecar::remove(data_dir, &filename);
        }
        return Ok(None);
    }

    let bytes = if let Some(inline) = record.inline_value {
        inline
    } else if let Some(filename) = &record.filename {
        sidecar::read(data_dir, filename)?
    } else {
        return Ok(None);
    };

    manifest::to_cache_result(manifest::touch_access_time(conn, key, now))?;
    Ok(Some(bytes))
}

#[allow(clippy::too_many_arguments)]
fn do_write(
    conn: &Connection,
    data_dir: &PathBuf,
    key: &str,
    bytes: &[u8],
    ttl: Option<Duration>,
    storage_mode: StorageMode,
    inline_threshold: u64,
) -> CacheResult<()> {
    let now = now_secs();
    let expire_at = ttl.map(|d| now + d.as_secs_f64());
    let size = bytes.len() as u64;

    let inline = match storage_mode {
        StorageMode::Inline => true,
        StorageMode::File => false,
        StorageMode::Mixed => size <= inline_threshold,
    };

    let previous_filename = manifest::to_cache_result(manifest::select_record(conn, key))?
        .and_then(|r| r.filename);

    if inline {
        manifest::to_cache_result(manifest::upsert_record(
            conn,
            key,
            size,
            now,
            expire_at,
            Some(bytes),
            None,
        ))?;
        // The record used to point at a sidecar file; now it doesn't, so
        // nothing references that file anymore (spec §3.2 invariant 3).
        if let Some(stale) = previous_filename {
            let _ = sidecar::remove(data_dir, &stale);
        }
    } else {
        let filename = sidecar::digest(key);
        sidecar::write_atomic(data_dir, &filename, bytes)?;
        manifest::to_cache_result(manifest::upsert_record(
            conn,
            key,
            size,
            now,
            expire_at,
            None,
            Some(&filename),
        ))?;
        // `filename` is a deterministic digest of `key`, so a previous
        // sidecar-backed write for this key would have used the same name
        // and was just overwritten atomically above; nothing to clean up.
    }
    Ok(())
}

fn do_remove(conn: &Connection, data_dir: &PathBuf, key: &str) -> CacheResult<()> {
    let filename = manifest::to_cache_result(manifest::delete_record(conn, key))?;
    if let Some(filename) = filename {
        let _ = sidecar::remove(data_dir, &filename);
    }
    Ok(())
}

fn do_clear(conn: &Connection, data_dir: &PathBuf) -> CacheResult<()> {
    manifest::to_cache_result(manifest::clear_all(conn))?;
    sidecar::clear_dir(data_dir)?;
    Ok(())
}

async fn run_trim(
    conn: Connection,
    data_dir: &PathBuf,
    config: &DiskConfig,
    metrics: &Option<Arc<Metrics>>,
) -> Connection {
    let data_dir = data_dir.clone();
    let config = config.clone();
    let (conn, evicted) = blocking(conn, move |conn| do_trim(conn, &data_dir, &config)).await;
    match evicted {
        Ok((count, bytes)) => {
            if count > 0 {
                debug!(count, bytes, "disk tier trim pass evicted entries");
                if let Some(m) = metrics {
                    m.record_trim(count, bytes);
                }
            }
        }
        Err(e) => warn!(error = %e, "disk tier trim pass failed"),
    }
    conn
}

fn do_trim(conn: &Connection, data_dir: &PathBuf, config: &DiskConfig) -> CacheResult<(u64, u64)> {
    let now = now_secs();
    let mut total_count = 0u64;
    let mut total_bytes = 0u64;

    let mut apply = |evicted: Vec<manifest::Evicted>| {
        for e in evicted {
            if let Some(filename) = &e.filename {
                let _ = sidecar::remove(data_dir, filename);
            }
            total_count += 1;
            total_bytes += e.size;
        }
    };

    apply(manifest::to_cache_result(manifest::trim_ttl(conn, now))?);

    if let Some(age_limit) = config.age_limit {
        let cutoff = now - age_limit.as_secs_f64();
        apply(manifest::to_cache_result(manifest::trim_age(conn, cutoff))?);
    }

    apply(manifest::to_cache_result(manifest::trim_count(
        conn,
        config.count_limit,
    ))?);
    apply(manifest::to_cache_result(manifest::trim_size(
        conn,
        config.byte_limit,
    ))?);

    Ok((total_count, total_bytes))
}

async fn blocking<F, T>(conn: Connection, f: F) -> (Connection, T)
where
    F: FnOnce(&Connection) -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = f(&conn);
        (conn, result)
    })
    .await
    .expect("disk tier worker task panicked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskConfig;

    fn test_config() -> DiskConfig {
        DiskConfig {
            enabled: true,
            byte_limit: u64::MAX,
            count_limit: u64::MAX,
            age_limit: None,
            auto_trim_interval: Duration::ZERO,
            inline_threshold_bytes: 8,
            storage_mode: StorageMode::Mixed,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", test_config(), None)
            .await
            .unwrap();
        tier.write("k".to_string(), b"hello".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(
            tier.read("k".to_string()).await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert!(tier.contains("k".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn large_value_spills_to_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", test_config(), None)
            .await
            .unwrap();
        let big = vec![7u8; 1000];
        tier.write("big".to_string(), big.clone(), None).await.unwrap();
        assert_eq!(tier.read("big".to_string()).await.unwrap(), Some(big));

        let data_dir = dir.path().join("cache").join("data");
        let entries: Vec<_> = std::fs::read_dir(&data_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn rewriting_a_key_smaller_removes_its_stale_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", test_config(), None)
            .await
            .unwrap();
        tier.write("k".to_string(), vec![7u8; 1000], None)
            .await
            .unwrap();
        let data_dir = dir.path().join("cache").join("data");
        assert_eq!(std::fs::read_dir(&data_dir).unwrap().count(), 1);

        tier.write("k".to_string(), b"hi".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(
            tier.read("k".to_string()).await.unwrap(),
            Some(b"hi".to_vec())
        );
        assert_eq!(std::fs::read_dir(&data_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn remove_deletes_row_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", test_config(), None)
            .await
            .unwrap();
        tier.write("big".to_string(), vec![1u8; 1000], None)
            .await
            .unwrap();
        tier.remove("big".to_string()).await.unwrap();
        assert_eq!(tier.read("big".to_string()).await.unwrap(), None);

        let data_dir = dir.path().join("cache").join("data");
        let entries: Vec<_> = std::fs::read_dir(&data_dir).unwrap().collect();
        assert_eq!(entries.len(), 0);
    }

    #[tokio::test]
    async fn ttl_expiry_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", test_config(), None)
            .await
            .unwrap();
        tier.write(
            "k".to_string(),
            b"hi".to_vec(),
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert_eq!(tier.read("k".to_string()).await.unwrap(), Some(b"hi".to_vec()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(tier.read("k".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", test_config(), None)
            .await
            .unwrap();
        tier.write("a".to_string(), vec![1u8; 1000], None).await.unwrap();
        tier.write("b".to_string(), b"small".to_vec(), None).await.unwrap();
        tier.clear().await.unwrap();
        assert_eq!(tier.read("a".to_string()).await.unwrap(), None);
        assert_eq!(tier.read("b".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn count_trim_keeps_most_recently_used() {
        let mut cfg = test_config();
        cfg.count_limit = 2;
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", cfg, None)
            .await
            .unwrap();
        tier.write("k1".to_string(), b"a".to_vec(), None).await.unwrap();
        tier.write("k2".to_string(), b"b".to_vec(), None).await.unwrap();
        tier.write("k3".to_string(), b"c".to_vec(), None).await.unwrap();

        assert!(!tier.contains("k1".to_string()).await.unwrap());
        assert!(tier.contains("k2".to_string()).await.unwrap());
        assert!(tier.contains("k3".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn storage_mode_inline_never_spills() {
        let mut cfg = test_config();
        cfg.storage_mode = StorageMode::Inline;
        cfg.inline_threshold_bytes = 0;
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", cfg, None)
            .await
            .unwrap();
        tier.write("k".to_string(), vec![9u8; 100_000], None)
            .await
            .unwrap();

        let data_dir = dir.path().join("cache").join("data");
        let entries: Vec<_> = std::fs::read_dir(&data_dir).unwrap().collect();
        assert_eq!(entries.len(), 0);
    }

    #[tokio::test]
    async fn storage_mode_file_always_spills() {
        let mut cfg = test_config();
        cfg.storage_mode = StorageMode::File;
        cfg.inline_threshold_bytes = 1024 * 1024;
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path().to_path_buf(), "cache", cfg, None)
            .await
            .unwrap();
        tier.write("k".to_string(), vec![1u8; 3], None).await.unwrap();

        let data_dir = dir.path().join("cache").join("data");
        let entries: Vec<_> = std::fs::read_dir(&data_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn reopening_the_same_directory_sees_prior_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tier = DiskTier::open(dir.path().to_path_buf(), "cache", test_config(), None)
                .await
                .unwrap();
            tier.write("greeting".to_string(), b"hello".to_vec(), None)
                .await
                .unwrap();
        }
        let tier2 = DiskTier::open(dir.path().to_path_buf(), "cache", test_config(), None)
            .await
            .unwrap();
        assert_eq!(
            tier2.read("greeting".to_string()).await.unwrap(),
            Some(b"hello".to_vec())
        );
    }
}
