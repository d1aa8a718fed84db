use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

/// Free-form string metadata stored alongside a value.
pub type Metadata = BTreeMap<String, String>;

/// A shared key-value store with per-item metadata.
///
/// The store has no notion of expiry, callers are responsible for
/// deciding when an item should be removed. Single key operations are
/// atomic, nothing is guaranteed across keys.
#[async_trait]
pub trait KeyValueStore: Sync + Send + 'static {
    /// Writes `value` under `key`, replacing any existing value and metadata.
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<Metadata>,
    ) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    async fn get_metadata(&self, key: &str) -> anyhow::Result<Option<Metadata>>;

    /// Removes the key. Deleting a key which does not exist is a no-op.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Lists every key currently held by the store.
    async fn list(&self) -> anyhow::Result<Vec<String>>;
}
