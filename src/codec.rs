//! The value<->bytes codec interface consumed by [`crate::CacheFacade`] (spec §6.1).
//!
//! Codecs are an external collaborator: production deployments typically
//! bring their own (a platform-archive format, a protobuf schema, ...). This
//! module defines the trait and ships two defaults for convenience.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CacheError, CacheResult};

/// Converts a value to and from the byte sequence actually stored by the cache.
pub trait Codec<V>: Send + Sync + 'static {
    /// Serialize a value. Failures propagate to the caller as [`CacheError::Encoding`].
    fn encode(&self, value: &V) -> CacheResult<Vec<u8>>;

    /// Deserialize a value. Failures propagate to the caller as [`CacheError::Decoding`].
    fn decode(&self, bytes: &[u8]) -> CacheResult<V>;
}

/// Passthrough codec for values that already are `Vec<u8>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl Codec<Vec<u8>> for IdentityCodec {
    fn encode(&self, value: &Vec<u8>) -> CacheResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// JSON codec for any `Serialize + DeserializeOwned` value.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<V> Codec<V> for JsonCodec
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, value: &V) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::Encoding(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<V> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Decoding(e.to_string()))
    }
}
