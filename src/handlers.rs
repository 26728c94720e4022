use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Response, Uri, header, uri::Authority},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use crate::cache::{CacheStats, CacheStatus, ResponseCache};
use crate::coalesce::CoalesceStats;
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::filter::{CacheFilter, FilterDecision, RelayedResponse, UpstreamRelay, build_response};
use crate::metrics::Metrics;
use crate::origin::OriginFetcher;
use crate::worker::WorkerPool;

pub struct AppState {
    pub cache: ResponseCache,
    pub origin: Arc<OriginFetcher>,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub workers: Arc<WorkerPool>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cache: CacheStats,
    pub coalescing: CoalesceStats,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub success: bool,
    pub message: String,
    pub purged_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub all: bool,
}

// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// Cache and coalescing statistics endpoint
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        cache: state.cache.stats(),
        coalescing: state.cache.coalesce_stats(),
    })
}

// Metrics endpoint (Prometheus format)
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = state.metrics.gather();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics,
    )
}

// Cache purge endpoint
pub async fn purge_cache(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PurgeRequest>,
) -> CacheResult<Json<PurgeResponse>> {
    let purged_count = if request.all {
        state.cache.purge_all()
    } else if let Some(host) = request.host {
        state.cache.purge_host(&host.to_ascii_lowercase())
    } else {
        return Err(CacheError::InvalidRequest(
            "Specify either \"host\" or \"all\"".to_string(),
        ));
    };

    Ok(Json(PurgeResponse {
        success: true,
        message: format!("Purged {} cache entries", purged_count),
        purged_count,
    }))
}

// Main proxy handler
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response<Body>, CacheError> {
    let host = request_host(&headers, &uri)?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let span = info_span!(
        "request",
        request_id = %Uuid::new_v4(),
        host = %host,
        path = %path
    );

    serve(state, method, host, path, headers)
        .instrument(span)
        .await
}

async fn serve(
    state: Arc<AppState>,
    method: Method,
    host: String,
    path: String,
    headers: HeaderMap,
) -> Result<Response<Body>, CacheError> {
    let start = Instant::now();
    let filter = CacheFilter::new(
        state.cache.clone(),
        state.workers.next(),
        state.config.cache.coalescing,
    );

    let (cache_status, response) = match filter.decode(&method, &host, &path, &headers) {
        FilterDecision::Bypass => {
            let upstream = state.origin.fetch(&host, &path, &headers).await?;
            state
                .metrics
                .record_origin_request(&host, upstream.head.status);
            let body = Body::from_stream(upstream.body);
            (
                CacheStatus::Bypass,
                build_response(upstream.head, body, CacheStatus::Bypass),
            )
        }
        FilterDecision::Hit(cached) => (
            CacheStatus::Hit,
            build_response(cached.head, Body::from(cached.body), CacheStatus::Hit),
        ),
        FilterDecision::Wait(stream) => {
            debug!("Waiting on in-flight fetch");
            let response =
                tokio::time::timeout(state.config.request_timeout(), stream.into_response())
                    .await
                    .map_err(|_| {
                        CacheError::OriginUnreachable(
                            "Timed out waiting for coalesced response".to_string(),
                        )
                    })??;
            (CacheStatus::Coalesced, response)
        }
        FilterDecision::Lead(guard) => {
            let relay = UpstreamRelay::new(
                state.cache.clone(),
                host.clone(),
                path.clone(),
                Some(guard),
            );
            let (head, body) = relay_upstream(&state, relay, &host, &path, &headers).await?;
            (CacheStatus::Miss, build_response(head, body, CacheStatus::Miss))
        }
        FilterDecision::Fetch => {
            let relay = UpstreamRelay::new(state.cache.clone(), host.clone(), path.clone(), None);
            let (head, body) = relay_upstream(&state, relay, &host, &path, &headers).await?;
            (CacheStatus::Miss, build_response(head, body, CacheStatus::Miss))
        }
    };

    state
        .metrics
        .record_request(&host, cache_status, response.status(), start.elapsed());

    Ok(response)
}

/// Fetch from the origin on the relay's own task and wait for the head.
///
/// Only the receiving end lives in the handler future, so a client that
/// hangs up cancels nothing but its own response.
async fn relay_upstream(
    state: &AppState,
    relay: UpstreamRelay,
    host: &str,
    path: &str,
    headers: &HeaderMap,
) -> CacheResult<RelayedResponse> {
    let origin = Arc::clone(&state.origin);
    let (fetch_host, fetch_path, fetch_headers) =
        (host.to_string(), path.to_string(), headers.clone());

    let (head, body) = relay
        .spawn(async move { origin.fetch(&fetch_host, &fetch_path, &fetch_headers).await })
        .await
        .map_err(|_| CacheError::Internal("Upstream relay stopped unexpectedly".to_string()))??;

    state.metrics.record_origin_request(host, head.status);
    Ok((head, body))
}

/// Lowercased host of the request, without port
pub fn request_host(headers: &HeaderMap, uri: &Uri) -> CacheResult<String> {
    let authority = match headers.get(header::HOST) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.parse::<Authority>().ok()),
        None => uri.authority().cloned(),
    };

    authority
        .map(|a| a.host().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CacheError::InvalidRequest("Missing or invalid Host header".to_string()))
}
