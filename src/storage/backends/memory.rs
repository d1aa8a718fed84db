use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::storage::{KeyValueStore, Metadata};

struct Entry {
    value: Bytes,
    metadata: Option<Metadata>,
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

#[async_trait]
impl KeyValueStore for MemoryBackend {
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<Metadata>,
    ) -> anyhow::Result<()> {
        debug!("Storing record @ {}", key);
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, metadata });
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.entries.read().await.get(key).map(|e| e.value.clone()))
    }

    async fn get_metadata(&self, key: &str) -> anyhow::Result<Option<Metadata>> {
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .and_then(|e| e.metadata.clone()))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        debug!("Purging record @ {}", key);
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() -> anyhow::Result<()> {
        let store = MemoryBackend::default();

        let mut meta = Metadata::new();
        meta.insert("mime_type".into(), "image/png".into());
        store.set("img/abc", Bytes::from_static(b"{}"), Some(meta)).await?;

        assert_eq!(store.get("img/abc").await?, Some(Bytes::from_static(b"{}")));
        let meta = store.get_metadata("img/abc").await?.expect("metadata missing");
        assert_eq!(meta.get("mime_type").map(String::as_str), Some("image/png"));
        assert_eq!(store.list().await?, vec!["img/abc".to_string()]);

        store.delete("img/abc").await?;
        assert!(store.get("img/abc").await?.is_none());
        assert!(store.get_metadata("img/abc").await?.is_none());

        // A second delete must be harmless.
        store.delete("img/abc").await?;
        assert!(store.list().await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_overwrite_drops_old_metadata() -> anyhow::Result<()> {
        let store = MemoryBackend::default();

        let mut meta = Metadata::new();
        meta.insert("a".into(), "b".into());
        store.set("job/1", Bytes::from_static(b"1"), Some(meta)).await?;
        store.set("job/1", Bytes::from_static(b"2"), None).await?;

        assert_eq!(store.get("job/1").await?, Some(Bytes::from_static(b"2")));
        assert!(store.get_metadata("job/1").await?.is_none());

        Ok(())
    }
}
