use thiserror::Error;

/// Failures surfaced by the upload, analysis and polling components.
///
/// The `Display` text is what ends up in error bodies and terminal
/// job records, so it is written for the end user.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Invalid API key")]
    Unauthorized,

    #[error("Image expired or not found. Please re-upload.")]
    NotFound,

    #[error("Session expired. Please re-upload.")]
    Expired,

    #[error("{0} data corrupt. Please re-upload.")]
    Corrupt(&'static str),

    #[error("Storage unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("{0}")]
    InferenceFailure(String),

    #[error("Analysis queue is full, please try again later.")]
    QueueFull,
}

impl PipelineError {
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}
