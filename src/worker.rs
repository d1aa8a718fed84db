use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join;

use crate::categories::{Category, CategoryRegistry};
use crate::config::RuntimeConfig;
use crate::error::PipelineError;
use crate::inference::{InferenceRequest, InferenceService};
use crate::records::{ImageRecord, JobRecord, Records, SessionStatus};
use crate::report::{self, Tier};
use crate::storage;
use crate::utils;

/// A request to analyse an upload, as received from the caller.
#[derive(Debug, Default, Clone)]
pub struct AnalysisRequest {
    pub job_id: Option<String>,
    pub session_id: Option<String>,
    pub blob_id: Option<String>,
    pub api_key: Option<String>,
    pub category: Option<String>,
    pub tier: Option<String>,
}

impl AnalysisRequest {
    /// The job identifier if one was given and is usable as a key.
    pub fn valid_job_id(&self) -> Option<&str> {
        self.job_id
            .as_deref()
            .filter(|id| utils::is_valid_identifier(id))
    }

    fn validate(self) -> Option<AnalysisJob> {
        let identifier = |v: Option<String>| v.filter(|id| utils::is_valid_identifier(id));

        Some(AnalysisJob {
            job_id: identifier(self.job_id)?,
            session_id: identifier(self.session_id)?,
            blob_id: identifier(self.blob_id)?,
            api_key: self.api_key.unwrap_or_default(),
            category: self.category.filter(|c| !c.trim().is_empty()),
            tier: Tier::from_request(self.tier.as_deref()),
        })
    }
}

#[derive(Debug)]
struct AnalysisJob {
    job_id: String,
    session_id: String,
    blob_id: String,
    api_key: String,
    category: Option<String>,
    tier: Tier,
}

/// The image and session records consumed by a job.
///
/// `release` deletes both. A lease which is dropped without being
/// released leaves the records for the sweeper.
struct SourceLease<'a> {
    records: &'a Records,
    image_key: String,
    session_key: String,
    released: bool,
}

impl<'a> SourceLease<'a> {
    fn acquire(records: &'a Records, session_id: &str, blob_id: &str) -> Self {
        Self {
            records,
            image_key: storage::image_key(blob_id),
            session_key: storage::session_key(session_id),
            released: false,
        }
    }

    /// Deletes the source records, failures are logged and never returned.
    async fn release(mut self) {
        let (image, session) = join(
            self.records.delete(&self.image_key),
            self.records.delete(&self.session_key),
        )
        .await;

        for (key, res) in [(&self.image_key, image), (&self.session_key, session)] {
            if let Err(e) = res {
                warn!(key = %key, error = %e, "Failed to release source record, leaving it for the sweeper");
            }
        }

        self.released = true;
    }
}

impl<'a> Drop for SourceLease<'a> {
    fn drop(&mut self) {
        if !self.released {
            debug!(image = %self.image_key, session = %self.session_key, "Source records left for the sweeper");
        }
    }
}

/// Runs a single analysis job from start to its terminal record.
pub struct AnalysisWorker {
    cfg: Arc<RuntimeConfig>,
    records: Records,
    inference: Arc<dyn InferenceService>,
}

impl AnalysisWorker {
    pub fn new(
        cfg: Arc<RuntimeConfig>,
        records: Records,
        inference: Arc<dyn InferenceService>,
    ) -> Self {
        Self {
            cfg,
            records,
            inference,
        }
    }

    #[inline]
    pub fn records(&self) -> &Records {
        &self.records
    }

    /// Processes the request, the outcome is only ever visible through the job record.
    pub async fn run(&self, req: AnalysisRequest) {
        if req.valid_job_id().is_none() {
            error!("Analysis request has no usable job_id, the outcome cannot be reported");
            return;
        }

        let job_id = req.job_id.clone().unwrap_or_default();
        let job = match req.validate() {
            Some(job) => job,
            None => {
                warn!(job_id = %job_id, "Analysis request is missing required fields, dropping it");
                return;
            },
        };

        let created_at = Utc::now();
        match self.process(&job, created_at).await {
            Ok(report_id) => info!(job_id = %job.job_id, report_id = %report_id, "Job complete"),
            Err(e) => self.fail(&job.job_id, created_at, &e).await,
        }
    }

    async fn fail(&self, job_id: &str, created_at: DateTime<Utc>, err: &PipelineError) {
        warn!(job_id = %job_id, error = %err, "Job failed");

        let record = JobRecord::failed(created_at, err.to_string(), Utc::now());
        if let Err(e) = self.records.put_job(job_id, &record).await {
            error!(job_id = %job_id, error = %e, "Failed to record job failure, the client will not be told");
        }
    }

    async fn process(&self, job: &AnalysisJob, created_at: DateTime<Utc>) -> Result<String, PipelineError> {
        let category = self.authorise(job)?;

        self.records
            .put_job(&job.job_id, &JobRecord::processing(created_at))
            .await?;
        let tier: &str = job.tier.as_ref();
        info!(job_id = %job.job_id, category = %category.name, tier = tier, "Job starting");

        let lease = SourceLease::acquire(&self.records, &job.session_id, &job.blob_id);
        let image = match self.load_image(&job.blob_id).await {
            Ok(image) => image,
            Err(PipelineError::Expired) => {
                lease.release().await;
                return Err(PipelineError::Expired);
            },
            Err(other) => return Err(other),
        };

        self.mark_session(&job.session_id, SessionStatus::Analysing).await;

        let report_id = report::generate_report_id(&category.report_prefix);
        let request = InferenceRequest {
            image_base64: image.image_base64,
            mime_type: image.mime_type,
            instructions: report::build_instructions(&category, job.tier, &report_id, Utc::now()),
            max_tokens: self.cfg.inference.max_tokens(job.tier),
        };

        info!(job_id = %job.job_id, "Calling inference service");
        let timeout = self.cfg.inference.timeout();
        let raw = match tokio::time::timeout(timeout, self.inference.analyse(request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(PipelineError::InferenceFailure(e.to_string())),
            Err(_) => {
                return Err(PipelineError::InferenceFailure(
                    "Analysis timed out. Please try again.".to_string(),
                ))
            },
        };

        let artifact = report::extract_artifact(&raw, category.format)?;
        info!(job_id = %job.job_id, size = artifact.size(), "Storing report");

        let record = JobRecord::complete(created_at, report_id.clone(), artifact, Utc::now());
        self.records.put_job(&job.job_id, &record).await?;

        lease.release().await;
        debug!(job_id = %job.job_id, session_id = %job.session_id, "Session released");

        Ok(report_id)
    }

    /// Checks the API key belongs to the declared category, or finds the
    /// category from the key when none was declared.
    fn authorise(&self, job: &AnalysisJob) -> Result<Category, PipelineError> {
        let registry = CategoryRegistry::load(&self.cfg.categories);

        let category = match job.category.as_deref() {
            Some(name) => registry.verify(name, &job.api_key),
            None => registry.by_key(&job.api_key),
        };

        category.cloned().ok_or_else(|| {
            warn!(job_id = %job.job_id, category = ?job.category, "Invalid API key for category");
            PipelineError::Unauthorized
        })
    }

    async fn load_image(&self, blob_id: &str) -> Result<ImageRecord, PipelineError> {
        // The metadata is enough to reject an expired upload without
        // pulling the payload.
        match self.records.image_expiry(blob_id).await {
            Ok(Some(expires_at)) if Utc::now() > expires_at => return Err(PipelineError::Expired),
            Ok(_) => {},
            Err(e) => debug!(blob_id = %blob_id, error = %e, "Image metadata unavailable"),
        }

        let image = match self.records.image(blob_id).await {
            Ok(Some(image)) => image,
            Ok(None) => return Err(PipelineError::NotFound),
            Err(PipelineError::StoreUnavailable(e)) => {
                warn!(blob_id = %blob_id, error = %e, "Image retrieval failed");
                return Err(PipelineError::NotFound);
            },
            Err(other) => return Err(other),
        };

        if Utc::now() > image.expires_at {
            return Err(PipelineError::Expired);
        }

        Ok(image)
    }

    /// Best-effort session status update.
    async fn mark_session(&self, session_id: &str, status: SessionStatus) {
        let mut session = match self.records.session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Session unavailable, skipping status update");
                return;
            },
        };

        session.status = status;
        session.updated_at = Some(Utc::now());
        if let Err(e) = self.records.put_session(session_id, &session).await {
            warn!(session_id = %session_id, status = %status, error = %e, "Failed to update session status");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Duration;

    use super::*;
    use crate::records::{JobStatus, SessionRecord};
    use crate::storage::backends::memory::MemoryBackend;
    use crate::storage::{KeyValueStore, Metadata};

    const CONFIG: &str = include_str!("../tests/configs/memory.yaml");

    struct FixedInference {
        response: Result<String, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceService for FixedInference {
        async fn analyse(&self, request: InferenceRequest) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(!request.image_base64.is_empty());
            self.response.clone().map_err(anyhow::Error::msg)
        }
    }

    struct Harness {
        worker: AnalysisWorker,
        store: Arc<dyn KeyValueStore>,
        inference: Arc<FixedInference>,
    }

    fn harness(response: Result<&str, &str>) -> Harness {
        let cfg = Arc::new(RuntimeConfig::from_yaml(CONFIG).unwrap());
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryBackend::default());
        let inference = Arc::new(FixedInference {
            response: response.map(String::from).map_err(String::from),
            calls: AtomicUsize::new(0),
        });

        let worker = AnalysisWorker::new(cfg, Records::new(store.clone()), inference.clone());
        Harness { worker, store, inference }
    }

    async fn seed(records: &Records, expires_in: Duration) -> (String, String) {
        let now = Utc::now();
        let blob_id = utils::new_identifier();
        let session_id = utils::new_identifier();

        let image = ImageRecord {
            image_base64: "AAAA".to_string(),
            mime_type: "image/png".to_string(),
            uploaded_at: now - Duration::minutes(1),
            expires_at: now + expires_in,
            domain: "vehiclevibe.app".to_string(),
            category: "vehicle".to_string(),
        };
        records.put_image(&blob_id, &image).await.unwrap();

        let session = SessionRecord {
            blob_id: blob_id.clone(),
            domain: image.domain.clone(),
            category: image.category.clone(),
            uploaded_at: image.uploaded_at,
            expires_at: image.expires_at,
            status: SessionStatus::Uploaded,
            updated_at: None,
        };
        records.put_session(&session_id, &session).await.unwrap();

        (session_id, blob_id)
    }

    fn request(job_id: &str, session_id: &str, blob_id: &str, key: &str) -> AnalysisRequest {
        AnalysisRequest {
            job_id: Some(job_id.to_string()),
            session_id: Some(session_id.to_string()),
            blob_id: Some(blob_id.to_string()),
            api_key: Some(key.to_string()),
            category: Some("vehiclevibe".to_string()),
            tier: None,
        }
    }

    #[tokio::test]
    async fn test_successful_job_consumes_sources() -> anyhow::Result<()> {
        let h = harness(Ok("```html\n<!DOCTYPE html><html><body>ok</body></html>\n```"));
        let (session_id, blob_id) = seed(h.worker.records(), Duration::minutes(10)).await;

        h.worker.run(request("job1", &session_id, &blob_id, "vehicle-test-key")).await;

        let job = h.worker.records().job("job1").await?.expect("job record");
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.html.as_deref(), Some("<!DOCTYPE html><html><body>ok</body></html>"));
        assert!(job.report_id.as_deref().unwrap_or_default().starts_with("VV-"));
        assert!(job.completed_at.is_some());

        assert_eq!(h.store.list().await?, vec!["job/job1".to_string()]);
        assert_eq!(h.inference.calls.load(Ordering::SeqCst), 1);

        Ok(())
    }

    /// Counts writes to session records.
    #[derive(Default)]
    struct SessionWrites {
        inner: MemoryBackend,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for SessionWrites {
        async fn set(&self, key: &str, value: Bytes, metadata: Option<Metadata>) -> anyhow::Result<()> {
            if key.starts_with("session/") {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.set(key, value, metadata).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
            self.inner.get(key).await
        }

        async fn get_metadata(&self, key: &str) -> anyhow::Result<Option<Metadata>> {
            self.inner.get_metadata(key).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.inner.delete(key).await
        }

        async fn list(&self) -> anyhow::Result<Vec<String>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_released_session_is_not_rewritten() -> anyhow::Result<()> {
        let cfg = Arc::new(RuntimeConfig::from_yaml(CONFIG)?);
        let store = Arc::new(SessionWrites::default());
        let inference = Arc::new(FixedInference {
            response: Ok("<!DOCTYPE html><html></html>".to_string()),
            calls: AtomicUsize::new(0),
        });
        let worker = AnalysisWorker::new(cfg, Records::new(store.clone()), inference);

        let (session_id, blob_id) = seed(worker.records(), Duration::minutes(10)).await;
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);

        worker.run(request("job1", &session_id, &blob_id, "vehicle-test-key")).await;

        // Only the move to analysing, the session is deleted once the report is stored.
        assert_eq!(store.writes.load(Ordering::SeqCst), 2);
        assert_eq!(store.list().await?, vec!["job/job1".to_string()]);

        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_key_never_reaches_inference() -> anyhow::Result<()> {
        let h = harness(Ok("<html></html>"));
        let (session_id, blob_id) = seed(h.worker.records(), Duration::minutes(10)).await;

        // A valid key, but for another category.
        h.worker.run(request("job2", &session_id, &blob_id, "listing-test-key")).await;

        let job = h.worker.records().job("job2").await?.expect("job record");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("Invalid API key"));
        assert_eq!(h.inference.calls.load(Ordering::SeqCst), 0);

        // Sources are untouched so the caller may retry.
        assert!(h.worker.records().image(&blob_id).await?.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_image_is_reported() -> anyhow::Result<()> {
        let h = harness(Ok("<html></html>"));

        h.worker.run(request("job3", "nosession", "noblob", "vehicle-test-key")).await;

        let job = h.worker.records().job("job3").await?.expect("job record");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("Image expired or not found. Please re-upload."));

        Ok(())
    }

    #[tokio::test]
    async fn test_expired_upload_is_released() -> anyhow::Result<()> {
        let h = harness(Ok("<html></html>"));
        let (session_id, blob_id) = seed(h.worker.records(), Duration::minutes(-1)).await;

        h.worker.run(request("job4", &session_id, &blob_id, "vehicle-test-key")).await;

        let job = h.worker.records().job("job4").await?.expect("job record");
        assert_eq!(job.error.as_deref(), Some("Session expired. Please re-upload."));
        assert_eq!(h.store.list().await?, vec!["job/job4".to_string()]);
        assert_eq!(h.inference.calls.load(Ordering::SeqCst), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_image_is_reported() -> anyhow::Result<()> {
        let h = harness(Ok("<html></html>"));
        h.store
            .set("img/broken", bytes::Bytes::from_static(b"{oops"), None)
            .await?;

        h.worker.run(request("job5", "sess", "broken", "vehicle-test-key")).await;

        let job = h.worker.records().job("job5").await?.expect("job record");
        assert_eq!(job.error.as_deref(), Some("Image data corrupt. Please re-upload."));

        Ok(())
    }

    #[tokio::test]
    async fn test_inference_failure_keeps_sources() -> anyhow::Result<()> {
        let h = harness(Err("upstream overloaded"));
        let (session_id, blob_id) = seed(h.worker.records(), Duration::minutes(10)).await;

        h.worker.run(request("job6", &session_id, &blob_id, "vehicle-test-key")).await;

        let job = h.worker.records().job("job6").await?.expect("job record");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("upstream overloaded"));

        let session = h.worker.records().session(&session_id).await?.expect("session");
        assert_eq!(session.status, SessionStatus::Analysing);

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_fields_write_nothing() -> anyhow::Result<()> {
        let h = harness(Ok("<html></html>"));

        h.worker
            .run(AnalysisRequest {
                job_id: Some("job7".to_string()),
                api_key: Some("vehicle-test-key".to_string()),
                ..Default::default()
            })
            .await;

        h.worker
            .run(AnalysisRequest {
                job_id: Some("../escape".to_string()),
                session_id: Some("s".to_string()),
                blob_id: Some("b".to_string()),
                ..Default::default()
            })
            .await;

        assert!(h.store.list().await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_category_is_inferred_from_key() -> anyhow::Result<()> {
        let h = harness(Ok("Sure! {\"disclosure_rating\": {\"badge\": \"GUARDED\"}}"));
        let (session_id, blob_id) = seed(h.worker.records(), Duration::minutes(10)).await;

        let mut req = request("job8", &session_id, &blob_id, "listing-test-key");
        req.category = None;
        h.worker.run(req).await;

        let job = h.worker.records().job("job8").await?.expect("job record");
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.report, Some(serde_json::json!({"disclosure_rating": {"badge": "GUARDED"}})));
        assert!(job.report_id.as_deref().unwrap_or_default().starts_with("LL-"));

        Ok(())
    }
}
