pub mod backends;
pub mod template;

pub use template::{KeyValueStore, Metadata};

/// The key prefix for stored image payloads.
pub const IMAGE_PREFIX: &str = "img/";

/// The key prefix for upload sessions.
pub const SESSION_PREFIX: &str = "session/";

/// The key prefix for analysis job records.
pub const JOB_PREFIX: &str = "job/";

#[inline]
pub fn image_key(blob_id: &str) -> String {
    format!("{}{}", IMAGE_PREFIX, blob_id)
}

#[inline]
pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}

#[inline]
pub fn job_key(job_id: &str) -> String {
    format!("{}{}", JOB_PREFIX, job_id)
}
