use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use enum_dispatch::enum_dispatch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::error::PipelineError;
use crate::report::Artifact;
use crate::storage::{self, KeyValueStore, Metadata};

/// An uploaded image waiting to be analysed, stored at `img/{blob_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_base64: String,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub domain: String,
    pub category: String,
}

impl ImageRecord {
    fn metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("mime_type".into(), self.mime_type.clone());
        meta.insert("uploaded_at".into(), self.uploaded_at.to_rfc3339());
        meta.insert("expires_at".into(), self.expires_at.to_rfc3339());
        meta.insert("category".into(), self.category.clone());
        meta
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Uploaded,
    Analysing,
    Complete,
}

/// The handle linking an upload to its analysis, stored at `session/{session_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub blob_id: String,
    pub domain: String,
    pub category: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// The state of an analysis job, stored at `job/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, alias = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, alias = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn empty(status: JobStatus, created_at: DateTime<Utc>) -> Self {
        Self {
            status,
            report_id: None,
            html: None,
            report: None,
            error: None,
            created_at: Some(created_at),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn processing(created_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(created_at),
            ..Self::empty(JobStatus::Processing, created_at)
        }
    }

    pub fn complete(
        created_at: DateTime<Utc>,
        report_id: String,
        artifact: Artifact,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let (html, report) = match artifact {
            Artifact::Html(html) => (Some(html), None),
            Artifact::Json(value) => (None, Some(value)),
        };

        Self {
            report_id: Some(report_id),
            html,
            report,
            started_at: Some(created_at),
            completed_at: Some(completed_at),
            ..Self::empty(JobStatus::Complete, created_at)
        }
    }

    pub fn failed(
        created_at: DateTime<Utc>,
        error: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            completed_at: Some(failed_at),
            ..Self::empty(JobStatus::Error, created_at)
        }
    }
}

/// Any other JSON document found in the store.
#[derive(Debug, Clone)]
pub struct LooseRecord(pub Value);

impl LooseRecord {
    fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        self.0
            .get(field)
            .and_then(Value::as_str)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc))
    }
}

/// Decides when a stored record may be reclaimed.
#[enum_dispatch]
pub trait Expiry {
    /// The instant after which the record is stale.
    ///
    /// `None` means the record carries nothing to reason about.
    fn expires_at(&self, ttl: Duration) -> Option<DateTime<Utc>>;
}

impl Expiry for ImageRecord {
    fn expires_at(&self, _ttl: Duration) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

impl Expiry for SessionRecord {
    fn expires_at(&self, _ttl: Duration) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

impl Expiry for JobRecord {
    /// A job lives for one ttl after it was last written, so a report which
    /// finishes late still gets the full window to be polled.
    fn expires_at(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        [self.completed_at, self.created_at, self.started_at]
            .into_iter()
            .flatten()
            .max()
            .map(|reference| reference + ttl)
    }
}

impl Expiry for LooseRecord {
    fn expires_at(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        ["uploaded_at", "startedAt", "started_at"]
            .iter()
            .find_map(|field| self.timestamp(field))
            .map(|reference| reference + ttl)
            .or_else(|| self.timestamp("expires_at"))
    }
}

/// A record read back from the store, typed by its key prefix.
#[enum_dispatch(Expiry)]
#[derive(Debug, Clone)]
pub enum StoredRecord {
    ImageRecord,
    SessionRecord,
    JobRecord,
    LooseRecord,
}

impl StoredRecord {
    pub fn parse(key: &str, data: &[u8]) -> serde_json::Result<Self> {
        let record = if key.starts_with(storage::IMAGE_PREFIX) {
            Self::ImageRecord(serde_json::from_slice(data)?)
        } else if key.starts_with(storage::SESSION_PREFIX) {
            Self::SessionRecord(serde_json::from_slice(data)?)
        } else if key.starts_with(storage::JOB_PREFIX) {
            Self::JobRecord(serde_json::from_slice(data)?)
        } else {
            Self::LooseRecord(LooseRecord(serde_json::from_slice(data)?))
        };

        Ok(record)
    }
}

/// Typed access to the records held in the keyed store.
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn KeyValueStore>,
}

impl Records {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn put_image(&self, blob_id: &str, record: &ImageRecord) -> Result<(), PipelineError> {
        self.write(&storage::image_key(blob_id), record, Some(record.metadata())).await
    }

    pub async fn image(&self, blob_id: &str) -> Result<Option<ImageRecord>, PipelineError> {
        self.read(&storage::image_key(blob_id), "Image").await
    }

    /// The expiry recorded in the image metadata, without loading the payload.
    pub async fn image_expiry(&self, blob_id: &str) -> Result<Option<DateTime<Utc>>, PipelineError> {
        let meta = self
            .store
            .get_metadata(&storage::image_key(blob_id))
            .await
            .map_err(PipelineError::StoreUnavailable)?;

        Ok(meta
            .as_ref()
            .and_then(|m| m.get("expires_at"))
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.with_timezone(&Utc)))
    }

    pub async fn put_session(&self, session_id: &str, record: &SessionRecord) -> Result<(), PipelineError> {
        self.write(&storage::session_key(session_id), record, None).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>, PipelineError> {
        self.read(&storage::session_key(session_id), "Session").await
    }

    pub async fn put_job(&self, job_id: &str, record: &JobRecord) -> Result<(), PipelineError> {
        self.write(&storage::job_key(job_id), record, None).await
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<JobRecord>, PipelineError> {
        self.read(&storage::job_key(job_id), "Job").await
    }

    pub async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        self.store
            .delete(key)
            .await
            .map_err(PipelineError::StoreUnavailable)
    }

    async fn read<T: DeserializeOwned>(
        &self,
        key: &str,
        kind: &'static str,
    ) -> Result<Option<T>, PipelineError> {
        let data = match self.store.get(key).await.map_err(PipelineError::StoreUnavailable)? {
            Some(data) => data,
            None => return Ok(None),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| {
                warn!(key = key, error = %e, "Stored record could not be parsed");
                PipelineError::Corrupt(kind)
            })
    }

    async fn write<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        metadata: Option<Metadata>,
    ) -> Result<(), PipelineError> {
        let data = serde_json::to_vec(value)
            .map_err(|e| PipelineError::StoreUnavailable(e.into()))?;

        self.store
            .set(key, Bytes::from(data), metadata)
            .await
            .map_err(PipelineError::StoreUnavailable)
    }
}
