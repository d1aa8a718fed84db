use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::storage::KeyValueStore;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendConfigs {
    /// Keeps every record in process memory.
    ///
    /// Records are lost on restart, which is fine for data that only
    /// lives for a few minutes anyway.
    Memory,

    /// Stores each record as a file under the given directory.
    FileSystem {
        directory: PathBuf,
    },
}

impl Default for BackendConfigs {
    fn default() -> Self {
        Self::Memory
    }
}

impl BackendConfigs {
    pub async fn connect(&self) -> anyhow::Result<Arc<dyn KeyValueStore>> {
        match self {
            Self::Memory => Ok(Arc::new(super::memory::MemoryBackend::default())),
            Self::FileSystem { directory } => {
                let backend = super::filesystem::FileSystemBackend::new(directory.clone());
                backend.ensure_directory().await?;
                Ok(Arc::new(backend))
            },
        }
    }
}
