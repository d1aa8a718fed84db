use serde_json::{json, Value};

use crate::error::PipelineError;
use crate::records::{JobStatus, Records};
use crate::storage;

/// The outcome of a status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The job body to hand back to the caller.
    Status(Value),

    /// The job record was read but could not be returned.
    Unavailable(Value),
}

/// Reports job progress and reclaims terminal job records on first read.
#[derive(Clone)]
pub struct StatusPoller {
    records: Records,
}

impl StatusPoller {
    pub fn new(records: Records) -> Self {
        Self { records }
    }

    /// Looks up the job.
    ///
    /// A job with no record yet is reported as processing, this also covers
    /// jobs whose terminal record has already been consumed. A store which
    /// cannot be read is treated the same so callers keep polling.
    pub async fn poll(&self, job_id: &str) -> PollOutcome {
        let job = match self.records.job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return PollOutcome::Status(json!({ "status": JobStatus::Processing })),
            Err(e @ PipelineError::Corrupt(_)) => {
                self.reclaim(job_id).await;
                return PollOutcome::Status(error_body(&e));
            },
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to read job record, reporting it as processing");
                return PollOutcome::Status(json!({ "status": JobStatus::Processing }));
            },
        };

        if job.status.is_terminal() {
            self.reclaim(job_id).await;
        }

        match serde_json::to_value(&job) {
            Ok(body) => PollOutcome::Status(body),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to serialize job record");
                PollOutcome::Unavailable(json!({
                    "status": JobStatus::Error,
                    "error": "Failed to read job status",
                }))
            },
        }
    }

    async fn reclaim(&self, job_id: &str) {
        if let Err(e) = self.records.delete(&storage::job_key(job_id)).await {
            warn!(job_id = %job_id, error = %e, "Failed to reclaim job record, leaving it for the sweeper");
        }
    }
}

fn error_body(err: &PipelineError) -> Value {
    json!({
        "status": JobStatus::Error,
        "error": err.to_string(),
    })
}
