//! Request pipeline middleware.
//!
//! Order is a contract (outermost first): request-id, real-ip, logging
//! and metrics, panic catch, timeout, CORS, then route-local layers (the
//! IP-block gate and the login rate limit sit on the public login routes
//! only).

use crate::gateway::error::ApiError;
use crate::gateway::extract::{RealIp, RequestId};
use crate::gateway::state::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use quay_core::Metrics;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Assign a unique id to each request and echo it in the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = quay_core::new_id();
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Resolve the client address: first hop of `X-Forwarded-For`, then
/// `X-Real-IP`, then the socket peer.
pub async fn real_ip(mut request: Request, next: Next) -> Response {
    let ip = forwarded_ip(&request)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());
    request.extensions_mut().insert(RealIp(ip));
    next.run(request).await
}

fn forwarded_ip(request: &Request) -> Option<String> {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        let first = forwarded.to_str().ok()?.split(',').next()?.trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Structured access log plus request/error counters.
pub async fn trace_requests(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    Metrics::incr(&state.metrics.http_requests_total);

    let response = next.run(request).await;

    let status = response.status();
    if status.is_server_error() {
        Metrics::incr(&state.metrics.http_errors_total);
        log::error!(
            "[http] {} {} -> {} ({} ms)",
            method,
            path,
            status.as_u16(),
            started.elapsed().as_millis()
        );
    } else {
        log::info!(
            "[http] {} {} -> {} ({} ms)",
            method,
            path,
            status.as_u16(),
            started.elapsed().as_millis()
        );
    }
    response
}

/// Public login routes only: reject callers with an active block before
/// any credential work happens.
pub async fn ip_block_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(RealIp(ip)) = request.extensions().get::<RealIp>().cloned() else {
        return ApiError::internal().into_response();
    };
    match state.security.is_blocked(&ip).await {
        Ok(Some(block)) => {
            let retry = block.retry_after_secs(state.clock.now_millis());
            ApiError::blocked(retry).into_response()
        }
        Ok(None) => next.run(request).await,
        Err(e) => {
            log::error!("[http] block check failed for {}: {}", ip, e);
            ApiError::internal().into_response()
        }
    }
}

/// Minute-window login rate limiter, per client ip.
#[derive(Default)]
pub struct LoginRateLimiter {
    window: Mutex<HashMap<String, (i64, u32)>>,
}

impl LoginRateLimiter {
    pub fn check(&self, ip: &str, now_ms: i64, limit: u32) -> bool {
        let mut window = self.window.lock().expect("rate limiter poisoned");
        let minute = now_ms / 60_000;
        let entry = window.entry(ip.to_string()).or_insert((minute, 0));
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        entry.1 += 1;
        // Occasional shrink so the map cannot grow without bound.
        if window.len() > 4096 {
            window.retain(|_, (m, _)| *m == minute);
        }
        window.get(ip).map(|(_, n)| *n <= limit).unwrap_or(true)
    }
}
