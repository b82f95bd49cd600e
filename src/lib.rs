//! # tiercache
//!
//! A two-tier key/value cache: a bounded in-memory LRU in front of an
//! optional on-disk manifest tier, coordinated by single-flight reads and
//! debounced, coalesced writes.
//!
//! ## Architecture
//!
//! - [`memory`]: the in-memory LRU tier — capacity, cost, age, and TTL eviction.
//! - [`disk`]: the on-disk manifest tier — a SQLite record of every entry plus
//!   sidecar files for large blobs, with its own TTL/age/count/byte trimming.
//! - [`single_flight`]: deduplicates concurrent cache-miss reads for the same key.
//! - [`coalescer`]: debounces bursts of writes to the same key into the last payload.
//! - [`metrics`]: monotonic counters and latency sums, snapshotable at any instant.
//! - [`codec`] / [`key_encoder`]: pluggable value<->bytes and key<->string transforms.
//! - [`facade`]: [`CacheFacade`], composing the above into the public API.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tiercache::{CacheConfig, CacheFacade, JsonCodec};
//!
//! # async fn example() -> tiercache::CacheResult<()> {
//! let cache: CacheFacade<String> =
//!     CacheFacade::open(CacheConfig::new("greetings"), Arc::new(JsonCodec)).await?;
//! cache.set("hello", "world".to_string(), 1, None).await?;
//! assert_eq!(cache.get("hello").await?, Some("world".to_string()));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod coalescer;
pub mod codec;
pub mod config;
pub mod disk;
pub mod error;
pub mod facade;
pub mod key_encoder;
pub mod memory;
pub mod metrics;
pub mod single_flight;

pub use codec::{Codec, IdentityCodec, JsonCodec};
pub use config::{CacheConfig, DiskConfig, MemoryConfig, StorageMode};
pub use error::{CacheError, CacheResult};
pub use facade::CacheFacade;
pub use key_encoder::{Blake3KeyEncoder, IdentityKeyEncoder, KeyEncoder};
pub use metrics::{Metrics, MetricsSnapshot};
