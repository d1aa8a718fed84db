use std::sync::Arc;

use chrono::SecondsFormat;
use poem::endpoint::BoxEndpoint;
use poem::{EndpointExt, Route};
use poem_openapi::param::Query;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi, OpenApiService};
use serde_json::Value;

use crate::config::{RateLimitConfig, RuntimeConfig};
use crate::error::PipelineError;
use crate::gateway::{UploadGateway, UploadReceipt, UploadRequest};
use crate::inference::InferenceService;
use crate::poller::{PollOutcome, StatusPoller};
use crate::queue::JobQueue;
use crate::ratelimit::RateLimit;
use crate::records::Records;
use crate::storage::KeyValueStore;
use crate::sweeper::{PurgeSummary, PurgeSweeper};
use crate::utils;
use crate::worker::{AnalysisRequest, AnalysisWorker};

#[derive(Object, Debug, Default)]
pub struct UploadPayload {
    /// The API key issued to the calling product.
    api_key: Option<String>,

    /// The image, base64 encoded.
    image_base64: Option<String>,

    /// One of `image/jpeg`, `image/png`, `image/webp` or `image/heic`.
    mime_type: Option<String>,
}

#[derive(Object, Debug)]
pub struct UploadInfo {
    /// The handle for this upload.
    session_id: String,

    /// The identifier of the stored image.
    ///
    /// This is passed back when requesting an analysis.
    blob_id: String,

    domain: String,
    category: String,
    uploaded_at: String,

    /// When the upload is discarded if it has not been analysed.
    expires_at: String,
}

impl From<UploadReceipt> for UploadInfo {
    fn from(receipt: UploadReceipt) -> Self {
        Self {
            session_id: receipt.session_id,
            blob_id: receipt.blob_id,
            domain: receipt.domain,
            category: receipt.category,
            uploaded_at: receipt.uploaded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            expires_at: receipt.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[derive(Object, Debug)]
pub struct Detail {
    /// Additional information regarding the response.
    error: String,
}

impl Detail {
    fn new(msg: impl Into<String>) -> Json<Self> {
        Json(Self { error: msg.into() })
    }
}

#[derive(Object, Debug, Default)]
pub struct AnalyzePayload {
    /// A caller generated identifier used to poll for the result.
    job_id: Option<String>,
    session_id: Option<String>,
    blob_id: Option<String>,
    api_key: Option<String>,

    /// The category (or product name) the API key belongs to.
    category: Option<String>,

    /// An alias of `category`.
    product: Option<String>,

    /// Either `standard` or `deep_dive`.
    tier: Option<String>,
}

impl From<AnalyzePayload> for AnalysisRequest {
    fn from(payload: AnalyzePayload) -> Self {
        Self {
            job_id: payload.job_id,
            session_id: payload.session_id,
            blob_id: payload.blob_id,
            api_key: payload.api_key,
            category: payload.category.or(payload.product),
            tier: payload.tier,
        }
    }
}

#[derive(Object, Debug)]
pub struct Accepted {
    job_id: Option<String>,

    /// If the job was handed to a worker.
    ///
    /// The outcome of the job itself is only available by polling.
    accepted: bool,
}

#[derive(Object, Debug)]
pub struct PurgeInfo {
    deleted: u64,
    errors: u64,
    checked: u64,
}

impl From<PurgeSummary> for PurgeInfo {
    fn from(summary: PurgeSummary) -> Self {
        Self {
            deleted: summary.deleted,
            errors: summary.errors,
            checked: summary.checked,
        }
    }
}

#[derive(ApiResponse)]
pub enum UploadResponse {
    #[oai(status = 200)]
    Ok(Json<UploadInfo>),

    /// The request was malformed or the image was rejected.
    #[oai(status = 400)]
    InvalidRequest(Json<Detail>),

    #[oai(status = 401)]
    Unauthorized(Json<Detail>),

    #[oai(status = 500)]
    StoreFailure(Json<Detail>),
}

#[derive(ApiResponse)]
pub enum AnalyzeResponse {
    /// The request was acknowledged.
    #[oai(status = 202)]
    Accepted(Json<Accepted>),
}

#[derive(ApiResponse)]
pub enum StatusResponse {
    /// The current state of the job.
    ///
    /// Terminal states are only ever returned once.
    #[oai(status = 200)]
    Ok(Json<Value>),

    #[oai(status = 400)]
    InvalidRequest(Json<Detail>),

    /// The job record could not be returned, the body still carries an error status.
    #[oai(status = 500)]
    Unavailable(Json<Value>),
}

#[derive(ApiResponse)]
pub enum PurgeResponse {
    #[oai(status = 200)]
    Ok(Json<PurgeInfo>),

    #[oai(status = 500)]
    Failed(Json<Detail>),
}

pub struct AppraiseApi {
    gateway: UploadGateway,
    queue: JobQueue,
    poller: StatusPoller,
    sweeper: Arc<PurgeSweeper>,
}

impl AppraiseApi {
    /// Wires the pipeline together, this starts the analysis worker pool.
    pub fn new(
        cfg: Arc<RuntimeConfig>,
        store: Arc<dyn KeyValueStore>,
        inference: Arc<dyn InferenceService>,
        sweeper: Arc<PurgeSweeper>,
    ) -> Self {
        let records = Records::new(store);
        let gateway = UploadGateway::new(cfg.clone(), records.clone());
        let poller = StatusPoller::new(records.clone());
        let worker = Arc::new(AnalysisWorker::new(cfg.clone(), records, inference));
        let queue = JobQueue::start(worker, &cfg.queue);

        Self {
            gateway,
            queue,
            poller,
            sweeper,
        }
    }
}

#[OpenApi]
impl AppraiseApi {
    /// Upload Image
    ///
    /// Stores an image for later analysis. The upload expires if it
    /// is not analysed within the session TTL.
    #[oai(path = "/upload", method = "post")]
    async fn upload(&self, payload: Json<UploadPayload>) -> UploadResponse {
        let payload = payload.0;
        let req = UploadRequest {
            api_key: payload.api_key,
            image_base64: payload.image_base64,
            mime_type: payload.mime_type,
        };

        match self.gateway.upload(req).await {
            Ok(receipt) => UploadResponse::Ok(Json(receipt.into())),
            Err(e @ PipelineError::InvalidRequest(_)) => UploadResponse::InvalidRequest(Detail::new(e.to_string())),
            Err(e @ PipelineError::Unauthorized) => UploadResponse::Unauthorized(Detail::new(e.to_string())),
            Err(e) => {
                error!(error = %e, "Upload failed");
                UploadResponse::StoreFailure(Detail::new("Failed to store image"))
            },
        }
    }

    /// Request Analysis
    ///
    /// Queues an analysis of a previously uploaded image. This never waits
    /// for the analysis, poll the status endpoint with the same `job_id`.
    #[oai(path = "/analyze", method = "post")]
    async fn analyze(&self, payload: Json<AnalyzePayload>) -> AnalyzeResponse {
        let req = AnalysisRequest::from(payload.0);
        let job_id = req.job_id.clone();

        let accepted = self.queue.submit(req).await.is_ok();

        AnalyzeResponse::Accepted(Json(Accepted { job_id, accepted }))
    }

    /// Job Status
    ///
    /// Reports the state of an analysis job. A finished job is removed
    /// once it has been returned.
    #[oai(path = "/status", method = "get")]
    async fn status(&self, job_id: Query<Option<String>>) -> StatusResponse {
        let job_id = match job_id.0 {
            Some(id) if utils::is_valid_identifier(&id) => id,
            Some(_) => return StatusResponse::InvalidRequest(Detail::new("job_id is invalid")),
            None => return StatusResponse::InvalidRequest(Detail::new("job_id is required")),
        };

        match self.poller.poll(&job_id).await {
            PollOutcome::Status(body) => StatusResponse::Ok(Json(body)),
            PollOutcome::Unavailable(body) => StatusResponse::Unavailable(Json(body)),
        }
    }

    /// Purge Expired
    ///
    /// Runs the sweeper immediately rather than waiting for its next interval.
    #[oai(path = "/admin/purge", method = "post")]
    async fn purge(&self) -> PurgeResponse {
        match self.sweeper.run().await {
            Ok(summary) => PurgeResponse::Ok(Json(summary.into())),
            Err(e) => {
                error!(error = %e, "Purge failed");
                PurgeResponse::Failed(Detail::new(format!("Purge failed: {}", e)))
            },
        }
    }
}

/// Builds the HTTP application, the API is served under `/v1` and its docs under `/ui`.
pub fn build_app(
    api: AppraiseApi,
    rate_limit: Option<RateLimitConfig>,
    server_url: &str,
) -> BoxEndpoint<'static> {
    let api_service = OpenApiService::new(api, "Appraise API", env!("CARGO_PKG_VERSION"))
        .server(format!("{}/v1", server_url.trim_end_matches('/')));
    let ui = api_service.redoc();

    let app = Route::new()
        .nest("/v1", api_service)
        .nest("/ui", ui);

    match rate_limit {
        Some(cfg) => app.with(RateLimit::new(cfg)).boxed(),
        None => app.boxed(),
    }
}
