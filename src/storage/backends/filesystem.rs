use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::{KeyValueStore, Metadata};

const METADATA_EXTENSION: &str = "meta";
const TEMP_EXTENSION: &str = "tmp";

/// Stores each key as a file, nested by its `/` separated segments.
///
/// Metadata lives in a `<name>.meta` sidecar file. Writes go through a
/// temporary file followed by a rename so a reader never sees a partially
/// written value.
pub struct FileSystemBackend {
    directory: PathBuf,
}

impl FileSystemBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            directory: dir,
        }
    }

    pub async fn ensure_directory(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        Ok(())
    }

    fn format_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let mut path = self.directory.clone();
        for segment in key.split('/') {
            let valid = !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

            if !valid {
                return Err(anyhow!("Key {:?} cannot be mapped to a file path", key));
            }
            path.push(segment);
        }

        Ok(path)
    }

    #[inline]
    fn metadata_path(path: &Path) -> PathBuf {
        path.with_extension(METADATA_EXTENSION)
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
        let tmp = path.with_extension(TEMP_EXTENSION);

        match tokio::fs::write(&tmp, data).await {
            Ok(()) => {},
            Err(ref e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&tmp, data).await?;
            },
            Err(other) => return Err(other.into()),
        }

        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    async fn read_if_exists(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(other) => Err(other.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileSystemBackend {
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<Metadata>,
    ) -> anyhow::Result<()> {
        let path = self.format_path(key)?;
        let meta_path = Self::metadata_path(&path);

        debug!("Storing record @ {:?}", &path);
        match metadata {
            Some(meta) => {
                let encoded = serde_json::to_vec(&meta)?;
                Self::write_atomic(&meta_path, &encoded).await?;
            },
            None => Self::remove_if_exists(&meta_path).await?,
        }

        Self::write_atomic(&path, &value).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let path = self.format_path(key)?;

        debug!("Retrieving record @ {:?}", &path);
        Ok(Self::read_if_exists(&path).await?.map(Bytes::from))
    }

    async fn get_metadata(&self, key: &str) -> anyhow::Result<Option<Metadata>> {
        let path = self.format_path(key)?;

        let data = match Self::read_if_exists(&Self::metadata_path(&path)).await? {
            Some(data) => data,
            None => return Ok(None),
        };

        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let path = self.format_path(key)?;

        debug!("Purging record @ {:?}", &path);
        Self::remove_if_exists(&path).await?;
        Self::remove_if_exists(&Self::metadata_path(&path)).await
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut keys = vec![];
        let mut pending = vec![(self.directory.clone(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(ref e) if e.kind() == ErrorKind::NotFound => continue,
                Err(other) => return Err(other.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();

                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), format!("{}{}/", prefix, name)));
                    continue;
                }

                // Sidecars and in-flight writes are not keys.
                if name.contains('.') {
                    continue;
                }

                keys.push(format!("{}{}", prefix, name));
            }
        }

        Ok(keys)
    }
}
