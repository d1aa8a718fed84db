use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use moka::sync::Cache;
use poem::http::StatusCode;
use poem::{Endpoint, IntoResponse, Middleware, Request, Response};

use crate::config::RateLimitConfig;

const RETRY_AFTER_SECS: &str = "60";

/// Counts requests per caller, path and fixed window and rejects anything
/// over the configured limit.
#[derive(Clone)]
pub struct RateLimit {
    cfg: Arc<RateLimitConfig>,
    counters: Cache<String, Arc<AtomicU32>>,
}

impl RateLimit {
    pub fn new(cfg: RateLimitConfig) -> Self {
        let window = Duration::from_secs(cfg.window_secs.max(1));
        let counters = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(window)
            .build();

        Self {
            cfg: Arc::new(cfg),
            counters,
        }
    }

    fn applies_to(&self, path: &str) -> bool {
        self.cfg.paths.iter().any(|p| p == path)
    }

    /// Records the request and returns if it is within the limit.
    fn admit(&self, caller: &str, path: &str) -> bool {
        let window_secs = self.cfg.window_secs.max(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let key = format!("{}:{}:{}", caller, path, now / window_secs);
        let counter = self.counters.get_with(key, || Arc::new(AtomicU32::new(0)));
        let count = counter.fetch_add(1, Ordering::Relaxed) + 1;

        count <= self.cfg.requests
    }
}

impl<E: Endpoint> Middleware<E> for RateLimit {
    type Output = RateLimitEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RateLimitEndpoint {
            inner: ep,
            limiter: self.clone(),
        }
    }
}

pub struct RateLimitEndpoint<E> {
    inner: E,
    limiter: RateLimit,
}

#[poem::async_trait]
impl<E: Endpoint> Endpoint for RateLimitEndpoint<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        let path = req.uri().path().to_string();

        if self.limiter.applies_to(&path) {
            let caller = caller_address(&req);
            if !self.limiter.admit(&caller, &path) {
                warn!(caller = %caller, path = %path, "Rate limit exceeded");
                return Ok(too_many_requests());
            }
        }

        self.inner.call(req).await.map(IntoResponse::into_response)
    }
}

/// The address of the original caller, preferring the first forwarded hop.
fn caller_address(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| req.remote_addr().to_string())
}

fn too_many_requests() -> Response {
    let body = serde_json::json!({
        "error": "Too many requests. Please try again later.",
    });

    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("Retry-After", RETRY_AFTER_SECS)
        .content_type("application/json")
        .body(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32) -> RateLimit {
        RateLimit::new(RateLimitConfig {
            requests,
            window_secs: 600,
            paths: vec!["/v1/upload".to_string()],
        })
    }

    #[test]
    fn test_limit_is_per_caller_and_path() {
        let limiter = limiter(2);

        assert!(limiter.admit("1.1.1.1", "/v1/upload"));
        assert!(limiter.admit("1.1.1.1", "/v1/upload"));
        assert!(!limiter.admit("1.1.1.1", "/v1/upload"));

        assert!(limiter.admit("2.2.2.2", "/v1/upload"));
        assert!(limiter.admit("1.1.1.1", "/v1/analyze"));
    }

    #[test]
    fn test_only_configured_paths_are_limited() {
        let limiter = limiter(1);

        assert!(limiter.applies_to("/v1/upload"));
        assert!(!limiter.applies_to("/v1/status"));
    }
}
