/*!
 * Fixed-window request rate limiting.
 *
 * Counters live in a process-local [`DashMap`] keyed by client, so limits
 * apply per instance. Health probes and the payment gateway's webhook are
 * exempt; the webhook is authenticated by its signature and throttling it
 * would only delay reconciliation.
 */

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::warn;

use crate::errors::ServiceError;

/// Paths the limiter never counts.
const EXEMPT_PREFIXES: &[&str] = &["/health"];
const EXEMPT_SUFFIXES: &[&str] = &["/payments/webhook"];

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimitEntry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn time_until_reset(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.duration_since(self.window_start))
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_duration: Duration,
    pub enable_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: crate::config::DEFAULT_RATE_LIMIT_REQUESTS,
            window_duration: Duration::from_secs(crate::config::DEFAULT_RATE_LIMIT_WINDOW_SECS),
            enable_headers: true,
        }
    }
}

/// Outcome of charging one request against a key
#[derive(Debug)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

#[derive(Clone)]
pub struct RateLimiter {
    entries: Arc<DashMap<String, RateLimitEntry>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn headers_enabled(&self) -> bool {
        self.config.enable_headers
    }

    /// Charge one request against the key and report whether it fit in the
    /// current window.
    pub fn check(&self, key: &str) -> RateLimitResult {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateLimitResult {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::new(now));

        entry.roll_window(now, self.config.window_duration);

        let allowed = entry.count < self.config.requests_per_window;
        if allowed {
            entry.count += 1;
        }

        RateLimitResult {
            allowed,
            limit: self.config.requests_per_window,
            remaining: self.config.requests_per_window.saturating_sub(entry.count),
            reset_after: entry.time_until_reset(now, self.config.window_duration),
        }
    }

    /// Drop counters whose window has passed. Meant for a periodic sweep so
    /// the map does not grow with every client ever seen.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let window = self.config.window_duration;
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < window);
    }
}

/// Pick the key a request is counted under: the forwarded client address
/// when a proxy supplies one, otherwise a shared bucket.
fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(ip) = value.split(',').next() {
                let ip = ip.trim();
                if !ip.is_empty() {
                    return format!("ip:{}", ip);
                }
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip) = real_ip.to_str() {
            return format!("ip:{}", ip);
        }
    }

    "ip:unknown".to_string()
}

fn is_exempt(path: &str) -> bool {
    EXEMPT_PREFIXES.iter().any(|p| path.starts_with(p))
        || EXEMPT_SUFFIXES.iter().any(|s| path.ends_with(s))
}

fn num_header<T: ToString>(n: T) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn apply_headers(response: &mut Response, result: &RateLimitResult) {
    let throttled = response.status() == StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", num_header(result.limit));
    headers.insert("x-ratelimit-remaining", num_header(result.remaining));
    headers.insert(
        "x-ratelimit-reset",
        num_header(result.reset_after.as_secs().max(1)),
    );
    if throttled {
        headers.insert(
            header::RETRY_AFTER,
            num_header(result.reset_after.as_secs().max(1)),
        );
    }
}

/// Middleware that enforces the shared limiter for every non-exempt route.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let key = client_key(&request);
    let result = limiter.check(&key);

    if !result.allowed {
        warn!(key = %key, "Rate limit exceeded");
        let mut response = ServiceError::RateLimitExceeded.into_response();
        if limiter.headers_enabled() {
            apply_headers(&mut response, &result);
        }
        return response;
    }

    let mut response = next.run(request).await;
    if limiter.headers_enabled() {
        apply_headers(&mut response, &result);
    }
    response
}
