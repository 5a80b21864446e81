//! Edge middleware: request-id propagation, request logging, and the
//! per-client sliding-window rate limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api_errors::ApiError;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Resolve the request id for a call: a sanitized client-supplied
/// `x-request-id`, else a fresh uuid.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(normalize_request_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn normalize_request_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 128 {
        return None;
    }
    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
    {
        return None;
    }
    Some(trimmed.to_string())
}

/// Echo the request id on every response so clients can correlate.
pub async fn request_id_middleware(headers: HeaderMap, request: Request, next: Next) -> Response {
    let rid = request_id(&headers);
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&rid) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub async fn request_log_middleware(headers: HeaderMap, request: Request, next: Next) -> Response {
    let rid = request_id(&headers);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    tracing::info!(
        request_id = %rid,
        %method,
        %path,
        status = response.status().as_u16(),
        "request"
    );
    response
}

/// Sliding 60-second window per client key.
pub struct RateLimiter {
    max_per_minute: usize,
    events: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            events: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> (bool, usize) {
        let now = Instant::now();
        let window_start = now - Duration::from_secs(60);
        let mut events = self.events.lock().expect("rate limiter lock");
        let queue = events.entry(key.to_string()).or_default();
        while queue.front().is_some_and(|t| *t < window_start) {
            queue.pop_front();
        }
        if queue.len() < self.max_per_minute {
            queue.push_back(now);
            (true, self.max_per_minute - queue.len())
        } else {
            (false, 0)
        }
    }
}

fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-api-key")
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| "local".to_string())
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let (allowed, remaining) = state.limiter.allow(&client_key(&headers));
    if !allowed {
        let rid = request_id(&headers);
        let mut response = ApiError::too_many_requests("rate limit exceeded")
            .with_request_id(rid)
            .into_response();
        response
            .headers_mut()
            .insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from_static("0"));
        return response;
    }
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        response
            .headers_mut()
            .insert(RATE_LIMIT_REMAINING_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_rejects_oversized_and_odd_characters() {
        assert_eq!(normalize_request_id("req-1.2:3_ok"), Some("req-1.2:3_ok".into()));
        assert_eq!(normalize_request_id(""), None);
        assert_eq!(normalize_request_id("bad id with spaces"), None);
        assert_eq!(normalize_request_id(&"x".repeat(200)), None);
    }

    #[test]
    fn limiter_counts_down_and_refuses_at_zero() {
        let limiter = RateLimiter::new(2);
        assert_eq!(limiter.allow("client"), (true, 1));
        assert_eq!(limiter.allow("client"), (true, 0));
        assert_eq!(limiter.allow("client"), (false, 0));
        // Another client has its own window.
        assert_eq!(limiter.allow("other"), (true, 1));
    }
}
