//! Composes the two tiers into the public cache API (spec §4.6).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::disk::DiskTier;
use crate::error::{CacheError, CacheResult};
use crate::key_encoder::{IdentityKeyEncoder, KeyEncoder};
use crate::memory::{MemoryTier, MemoryTierConfig, TrimmerHandle};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::single_flight::SingleFlight;
use crate::coalescer::WriteCoalescer;

/// Returns the platform cache directory to root cache instances under when
/// [`CacheConfig::directory`] is unset.
fn default_data_root() -> PathBuf {
    dirs_fallback().join("tiercache")
}

/// A tiny `dirs`-style fallback so this crate does not need the `dirs` crate
/// for one lookup: `$XDG_CACHE_HOME` or `$HOME/.cache`, falling back to the
/// process's current directory if neither is set.
fn dirs_fallback() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".cache");
        }
    }
    PathBuf::from(".")
}

/// The two-tier cache: an in-memory LRU in front of an optional on-disk
/// manifest tier, coordinated by single-flight reads and coalesced writes.
pub struct CacheFacade<V> {
    config: CacheConfig,
    memory: Arc<MemoryTier<String, V>>,
    disk: Option<Arc<DiskTier>>,
    single_flight: Arc<SingleFlight<String, Option<V>>>,
    coalescer: Option<Arc<WriteCoalescer<String, (Vec<u8>, Option<Duration>)>>>,
    metrics: Arc<Metrics>,
    codec: Arc<dyn Codec<V>>,
    key_encoder: Arc<dyn KeyEncoder>,
    _memory_trimmer: Option<TrimmerHandle>,
}

impl<V> CacheFacade<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Opens a cache instance named by `config.name`, creating its on-disk
    /// directory (if the disk tier is enabled) under `config.directory` or
    /// the platform cache root.
    pub async fn open(config: CacheConfig, codec: Arc<dyn Codec<V>>) -> CacheResult<Self> {
        Self::open_with_key_encoder(config, codec, Arc::new(IdentityKeyEncoder)).await
    }

    pub async fn open_with_key_encoder(
        config: CacheConfig,
        codec: Arc<dyn Codec<V>>,
        key_encoder: Arc<dyn KeyEncoder>,
    ) -> CacheResult<Self> {
        if config.name.is_empty() {
            return Err(CacheError::InvalidKey("cache name must not be empty".into()));
        }

        let metrics = Arc::new(Metrics::new());

        let memory = Arc::new(MemoryTier::with_metrics(
            MemoryTierConfig {
                count_limit: config.memory.count_limit,
                cost_limit: config.memory.cost_limit,
                age_limit: config.memory.age_limit,
            },
            Arc::clone(&metrics),
        ));
        let memory_trimmer = memory.spawn_background_trim(config.memory.auto_trim_interval);

        let (disk, coalescer) = if config.disk.enabled {
            let base_dir = config
                .directory
                .clone()
                .unwrap_or_else(default_data_root);
            let disk = Arc::new(
                DiskTier::open(
                    base_dir,
                    &config.name,
                    config.disk.clone(),
                    if config.metrics_enabled {
                        Some(Arc::clone(&metrics))
                    } else {
                        None
                    },
                )
                .await?,
            );
            let coalescer = Arc::new(WriteCoalescer::new(Duration::from_millis(100)));
            (Some(disk), Some(coalescer))
        } else {
            (None, None)
        };

        if config.logging_enabled {
            info!(name = %config.name, disk_enabled = config.disk.enabled, "cache opened");
        }

        Ok(Self {
            config,
            memory,
            disk,
            single_flight: Arc::new(SingleFlight::new()),
            coalescer,
            metrics,
            codec,
            key_encoder,
            _memory_trimmer: memory_trimmer,
        })
    }

    /// Looks up `key`: a memory hit returns immediately; a miss with the
    /// disk tier enabled triggers a single-flight-deduplicated disk read
    /// that repopulates memory on success (spec §4.6 `get`).
    pub async fn get(&self, key: &str) -> CacheResult<Option<V>> {
        let started = Instant::now();
        let encoded = self.key_encoder.encode(key);

        if let Some(v) = self.memory.get(&encoded) {
            self.metrics.record_memory_hit();
            self.metrics.record_get(started.elapsed());
            return Ok(Some(v));
        }
        self.metrics.record_memory_miss();

        let Some(disk) = self.disk.clone() else {
            self.metrics.record_get(started.elapsed());
            return Ok(None);
        };

        let memory = Arc::clone(&self.memory);
        let codec = Arc::clone(&self.codec);
        let metrics = Arc::clone(&self.metrics);
        let fetch_key = encoded.clone();

        let result = self
            .single_flight
            .run_or_join(encoded.clone(), async move {
                match disk.read(fetch_key.clone()).await {
                    Ok(Some(bytes)) => {
                        let value = codec.decode(&bytes)?;
                        let cost = bytes.len() as u64;
                        memory.put(fetch_key, value.clone(), cost, None);
                        Ok(Some(value))
                    }
                    Ok(None) => Ok(None),
                    Err(e) => {
                        warn!(error = %e, "disk read failed; treating as miss");
                        metrics.record_disk_miss();
                        Ok(None)
                    }
                }
            })
            .await;

        self.metrics.record_get(started.elapsed());
        result
    }

    /// Writes `value` into memory synchronously, then (if the disk tier is
    /// enabled) enqueues a coalesced write to disk (spec §4.6 `set`).
    pub async fn set(
        &self,
        key: &str,
        value: V,
        cost: u64,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let started = Instant::now();
        let encoded = self.key_encoder.encode(key);

        let bytes = if self.disk.is_some() {
            Some(self.codec.encode(&value)?)
        } else {
            None
        };

        self.memory.put(encoded.clone(), value, cost, ttl);

        if let (Some(disk), Some(coalescer), Some(bytes)) =
            (self.disk.clone(), self.coalescer.clone(), bytes)
        {
            coalescer.submit(encoded, (bytes, ttl), move |k, (bytes, ttl)| {
                let disk = Arc::clone(&disk);
                async move {
                    if let Err(e) = disk.write(k, bytes, ttl).await {
                        warn!(error = %e, "coalesced disk write failed");
                    }
                }
            });
        }

        self.metrics.record_set(started.elapsed());
        Ok(())
    }

    /// Removes `key` from both tiers.
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        let encoded = self.key_encoder.encode(key);
        self.memory.remove(&encoded);
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.remove(encoded).await {
                warn!(error = %e, "disk remove failed");
            }
        }
        Ok(())
    }

    /// Empties both tiers.
    pub async fn clear(&self) -> CacheResult<()> {
        self.memory.clear();
        if let Some(disk) = &self.disk {
            disk.clear().await?;
        }
        Ok(())
    }

    /// Checks membership without loading the value: memory first, then (if
    /// absent and the disk tier is enabled) a manifest-only probe.
    pub async fn contains(&self, key: &str) -> CacheResult<bool> {
        let encoded = self.key_encoder.encode(key);
        if self.memory.contains(&encoded) {
            return Ok(true);
        }
        match &self.disk {
            Some(disk) => disk.contains(encoded).await,
            None => Ok(false),
        }
    }

    /// A consistent snapshot of all counters (spec §4.5).
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::config::{DiskConfig, MemoryConfig};

    fn memory_only_config(name: &str) -> CacheConfig {
        CacheConfig {
            name: name.to_string(),
            directory: None,
            memory: MemoryConfig {
                count_limit: 1000,
                ..MemoryConfig::default()
            },
            disk: DiskConfig {
                enabled: false,
                ..DiskConfig::default()
            },
            logging_enabled: false,
            metrics_enabled: true,
        }
    }

    #[tokio::test]
    async fn memory_only_set_get_contains() {
        let cache: CacheFacade<i32> = CacheFacade::open(
            memory_only_config("answer-cache"),
            Arc::new(JsonCodec),
        )
        .await
        .unwrap();

        cache.set("answer", 42, 1, None).await.unwrap();
        assert_eq!(cache.get("answer").await.unwrap(), Some(42));
        assert!(cache.contains("answer").await.unwrap());
        assert_eq!(cache.metrics().memory_hits, 1);
    }

    #[tokio::test]
    async fn remove_and_clear_drop_resident_entries() {
        let cache: CacheFacade<i32> =
            CacheFacade::open(memory_only_config("rm-clear"), Arc::new(JsonCodec))
                .await
                .unwrap();

        cache.set("a", 1, 1, None).await.unwrap();
        cache.set("b", 2, 1, None).await.unwrap();
        cache.remove("a").await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.get("b").await.unwrap(), Some(2));

        cache.clear().await.unwrap();
        assert_eq!(cache.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_an_empty_cache_name() {
        let err = CacheFacade::<i32>::open(CacheConfig::new(""), Arc::new(JsonCodec))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
    }
}
