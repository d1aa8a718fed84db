use async_trait::async_trait;

use crate::report::Instructions;

pub mod anthropic;
mod register;

pub use register::InferenceConfigs;

/// A single image analysis call.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// The base64 encoded image exactly as it was uploaded.
    pub image_base64: String,
    pub mime_type: String,
    pub instructions: Instructions,
    pub max_tokens: u32,
}

/// The external service which turns an image into a report.
///
/// Calls may take minutes, callers should never hold a request open on one.
#[async_trait]
pub trait InferenceService: Sync + Send + 'static {
    /// Returns the raw text produced by the service.
    async fn analyse(&self, request: InferenceRequest) -> anyhow::Result<String>;
}
