use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tracing_futures::Instrument;

use crate::config::QueueConfig;
use crate::error::PipelineError;
use crate::records::JobRecord;
use crate::worker::{AnalysisRequest, AnalysisWorker};

/// Hands analysis requests to a pool of background workers.
///
/// Submitting never waits for the job to run, the store is the only
/// place its outcome can be observed.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<AnalysisRequest>,
    worker: Arc<AnalysisWorker>,
}

impl JobQueue {
    /// Creates the queue and spawns its consumer onto the current runtime.
    pub fn start(worker: Arc<AnalysisWorker>, cfg: &QueueConfig) -> Self {
        let queue_size = cfg.queue_size.max(1);
        let max_concurrency = cfg.max_concurrency.max(1);
        let (tx, rx) = mpsc::channel(queue_size);

        tokio::spawn(Self::worker_pool(rx, worker.clone(), max_concurrency));

        info!(
            queue_size = queue_size,
            max_concurrency = max_concurrency,
            "Analysis job queue started"
        );

        Self { tx, worker }
    }

    /// Enqueues the request without waiting.
    ///
    /// When the queue is full the job is marked as failed straight away so
    /// pollers are not left waiting on it.
    pub async fn submit(&self, req: AnalysisRequest) -> Result<(), PipelineError> {
        let req = match self.tx.try_send(req) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(req)) => {
                warn!("Analysis job queue is full, rejecting job");
                req
            },
            Err(TrySendError::Closed(req)) => {
                error!("Analysis job queue is closed, rejecting job");
                req
            },
        };

        if let Some(job_id) = req.valid_job_id() {
            let now = Utc::now();
            let record = JobRecord::failed(now, PipelineError::QueueFull.to_string(), now);
            if let Err(e) = self.worker.records().put_job(job_id, &record).await {
                error!(job_id = %job_id, error = %e, "Failed to record rejected job");
            }
        }

        Err(PipelineError::QueueFull)
    }

    async fn worker_pool(
        mut rx: mpsc::Receiver<AnalysisRequest>,
        worker: Arc<AnalysisWorker>,
        max_concurrency: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        while let Some(req) = rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let job_id = req.job_id.clone().unwrap_or_default();
            let span = info_span!("analysis", job_id = %job_id);

            let worker = worker.clone();
            tokio::spawn(
                async move {
                    let _permit = permit;
                    worker.run(req).await;
                }
                .instrument(span),
            );
        }

        debug!("Analysis job queue closed");
    }
}
