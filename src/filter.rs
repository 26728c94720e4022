//! Per-request cache filter
//!
//! Decides for one request whether it bypasses the cache, is served from a
//! ring buffer, drives an upstream fetch as leader, or waits on another
//! request's fetch. The filter owns its cache handle; the cache only ever
//! sees the narrow [`Waiter`] capability of a waiting request.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Response};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cache::{CacheStatus, ResponseCache, generate_cache_key, is_bypass};
use crate::coalesce::{ExecutionContext, JoinOutcome, LeaderGuard, Waiter};
use crate::error::{CacheError, CacheResult};
use crate::origin::{BodyStream, OriginResponse};
use crate::response::{CachedResponse, ResponseHead};
use crate::worker::RunLoopHandle;

pub const X_CACHE: &str = "x-cache";

/// Buffered chunks between the leader's relay task and its own client
const CLIENT_CHANNEL_CAPACITY: usize = 16;

/// Upstream response head and the body streamed to the requesting client
pub type RelayedResponse = (ResponseHead, Body);

/// What a waiting request is handed by the leader, in order
#[derive(Debug)]
pub enum Delivery {
    Headers { head: ResponseHead, end_stream: bool },
    Body { chunk: Bytes, end_stream: bool },
    Reset,
}

/// Waiter that forwards deliveries to the request task through a channel.
///
/// Deliveries arrive on the request's run loop; a closed channel means the
/// client went away and the delivery is dropped.
pub struct ChannelWaiter {
    context: RunLoopHandle,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelWaiter {
    pub fn channel(context: RunLoopHandle) -> (Arc<Self>, WaiterStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { context, tx }), WaiterStream { rx })
    }
}

impl Waiter for ChannelWaiter {
    fn deliver_headers(&self, head: ResponseHead, end_stream: bool) {
        let _ = self.tx.send(Delivery::Headers { head, end_stream });
    }

    fn deliver_body(&self, chunk: Bytes, end_stream: bool) {
        let _ = self.tx.send(Delivery::Body { chunk, end_stream });
    }

    fn deliver_reset(&self) {
        let _ = self.tx.send(Delivery::Reset);
    }

    fn execution_context(&self) -> &dyn ExecutionContext {
        &self.context
    }
}

/// Receiving side of a [`ChannelWaiter`]
pub struct WaiterStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl WaiterStream {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Wait for the replayed headers and stream the rest of the replay as
    /// the response body.
    pub async fn into_response(mut self) -> CacheResult<Response<Body>> {
        match self.rx.recv().await {
            Some(Delivery::Headers { head, end_stream }) => {
                let body = if end_stream {
                    Body::empty()
                } else {
                    Body::from_stream(self.into_body_stream())
                };
                Ok(build_response(head, body, CacheStatus::Coalesced))
            }
            Some(Delivery::Body { .. }) => Err(CacheError::Internal(
                "Coalesced body arrived before headers".to_string(),
            )),
            Some(Delivery::Reset) | None => Err(CacheError::OriginError(
                "Coalesced upstream fetch failed".to_string(),
            )),
        }
    }

    fn into_body_stream(self) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        stream::unfold(Some(self.rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await {
                Some(Delivery::Body { chunk, end_stream }) => {
                    let next = if end_stream { None } else { Some(rx) };
                    Some((Ok(chunk), next))
                }
                Some(Delivery::Headers { .. }) => {
                    Some((Err(io::Error::other("duplicate coalesced headers")), None))
                }
                Some(Delivery::Reset) | None => {
                    Some((Err(io::Error::other("coalesced upstream fetch aborted")), None))
                }
            }
        })
    }
}

pub enum FilterDecision {
    /// Not a cacheable request, or the client asked for no-cache
    Bypass,
    Hit(CachedResponse),
    /// First miss for the key: fetch upstream and feed the group
    Lead(LeaderGuard),
    /// Another request is fetching this key
    Wait(WaiterStream),
    /// Miss with coalescing disabled
    Fetch,
}

pub struct CacheFilter {
    cache: ResponseCache,
    context: RunLoopHandle,
    coalescing: bool,
}

impl CacheFilter {
    pub fn new(cache: ResponseCache, context: RunLoopHandle, coalescing: bool) -> Self {
        Self {
            cache,
            context,
            coalescing,
        }
    }

    pub fn decode(
        &self,
        method: &Method,
        host: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> FilterDecision {
        if method != Method::GET || is_bypass(headers) {
            debug!(host = %host, path = %path, method = %method, "Bypassing cache");
            return FilterDecision::Bypass;
        }

        if let Some(response) = self.cache.get(host, path) {
            return FilterDecision::Hit(response);
        }

        if !self.coalescing {
            return FilterDecision::Fetch;
        }

        let (waiter, stream) = ChannelWaiter::channel(self.context.clone());
        match self
            .cache
            .try_become_leader_or_join(&generate_cache_key(host, path), waiter)
        {
            JoinOutcome::Leader(guard) => FilterDecision::Lead(guard),
            JoinOutcome::Joined => FilterDecision::Wait(stream),
        }
    }
}

/// Only complete successful responses are stored
pub fn is_cacheable(head: &ResponseHead) -> bool {
    head.status.is_success()
}

/// Pumps an upstream body to the requesting client, the coalescing group
/// (when leading) and finally the cache.
pub struct UpstreamRelay {
    cache: ResponseCache,
    host: String,
    path: String,
    leader: Option<LeaderGuard>,
}

impl UpstreamRelay {
    pub fn new(
        cache: ResponseCache,
        host: impl Into<String>,
        path: impl Into<String>,
        leader: Option<LeaderGuard>,
    ) -> Self {
        Self {
            cache,
            host: host.into(),
            path: path.into(),
            leader,
        }
    }

    /// Run the upstream fetch and the relay on one detached task.
    ///
    /// The leader guard moves into that task before anything is awaited, so
    /// a requesting client that goes away (before or after the upstream
    /// headers) never cancels the fetch other requests are waiting on. The
    /// receiver yields the response head and the body for the requesting
    /// client, or the fetch error.
    pub fn spawn<F>(self, fetch: F) -> oneshot::Receiver<CacheResult<RelayedResponse>>
    where
        F: Future<Output = CacheResult<OriginResponse>> + Send + 'static,
    {
        let (head_tx, head_rx) = oneshot::channel();

        tokio::spawn(async move {
            let upstream = match fetch.await {
                Ok(upstream) => upstream,
                Err(e) => {
                    // Dropping the guard resets the waiters
                    drop(self);
                    let _ = head_tx.send(Err(e));
                    return;
                }
            };

            let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
            let body = Body::from_stream(receiver_stream(rx));
            if head_tx.send(Ok((upstream.head.clone(), body))).is_err() {
                debug!(
                    host = %self.host,
                    path = %self.path,
                    "Client went away before upstream headers, finishing fetch"
                );
            }

            self.run(upstream.head, upstream.body, tx).await;
        });

        head_rx
    }

    pub async fn run(
        mut self,
        head: ResponseHead,
        mut upstream: BodyStream,
        client: mpsc::Sender<Result<Bytes, io::Error>>,
    ) {
        let store = is_cacheable(&head);
        let mut client = Some(client);
        let mut buffered = BytesMut::new();

        if let Some(guard) = self.leader.as_mut() {
            guard.set_headers(head.clone());
            guard.flush();
        }

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    match self.leader.as_mut() {
                        Some(guard) => {
                            guard.append_body(&chunk);
                            guard.flush();
                        }
                        None if store => buffered.extend_from_slice(&chunk),
                        None => {}
                    }

                    let disconnected = match &client {
                        Some(tx) => tx.send(Ok(chunk)).await.is_err(),
                        None => false,
                    };
                    if disconnected {
                        debug!(
                            host = %self.host,
                            path = %self.path,
                            "Client disconnected, finishing fetch"
                        );
                        client = None;
                    }
                }
                Err(e) => {
                    warn!(
                        host = %self.host,
                        path = %self.path,
                        error = %e,
                        "Upstream body failed"
                    );
                    if let Some(tx) = &client {
                        let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                    }
                    // Dropping the guard resets the waiters
                    return;
                }
            }
        }

        if store {
            let response = match self.leader.as_ref() {
                Some(guard) => guard.snapshot(),
                None => Some(CachedResponse::new(head, &buffered)),
            };
            if let Some(response) = response {
                self.cache.store(&self.host, &self.path, response);
            }
        }

        if let Some(guard) = self.leader.take() {
            guard.finish();
        }
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl Stream<Item = T> + Send {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

pub fn build_response(head: ResponseHead, body: Body, status: CacheStatus) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(status.as_str()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerPool;
    use axum::http::{StatusCode, header};

    fn head(status: StatusCode) -> ResponseHead {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        ResponseHead::new(status, headers)
    }

    fn upstream(chunks: Vec<CacheResult<Bytes>>) -> BodyStream {
        stream::iter(chunks).boxed()
    }

    /// Relay an upstream response that is already available and return the
    /// requesting client's body
    async fn relay_ready(
        relay: UpstreamRelay,
        status: StatusCode,
        chunks: Vec<CacheResult<Bytes>>,
    ) -> Body {
        let response = OriginResponse {
            head: head(status),
            body: upstream(chunks),
        };
        let (_, body) = relay
            .spawn(async move { Ok(response) })
            .await
            .unwrap()
            .unwrap();
        body
    }

    async fn collect(body: Body) -> Result<Bytes, axum::Error> {
        let mut stream = body.into_data_stream();
        let mut out = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    #[test]
    fn test_decode_bypass() {
        let pool = WorkerPool::new(1).unwrap();
        let cache = ResponseCache::with_capacity(4).unwrap();
        let filter = CacheFilter::new(cache, pool.next(), true);

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        assert!(matches!(
            filter.decode(&Method::GET, "a.com", "/x", &headers),
            FilterDecision::Bypass
        ));
        assert!(matches!(
            filter.decode(&Method::POST, "a.com", "/x", &HeaderMap::new()),
            FilterDecision::Bypass
        ));
        pool.shutdown();
    }

    #[test]
    fn test_decode_hit_lead_wait() {
        let pool = WorkerPool::new(1).unwrap();
        let cache = ResponseCache::with_capacity(4).unwrap();
        let filter = CacheFilter::new(cache.clone(), pool.next(), true);
        let none = HeaderMap::new();

        let leader = filter.decode(&Method::GET, "a.com", "/x", &none);
        assert!(matches!(leader, FilterDecision::Lead(_)));
        assert!(matches!(
            filter.decode(&Method::GET, "a.com", "/x", &none),
            FilterDecision::Wait(_)
        ));

        cache.store("a.com", "/y", CachedResponse::new(head(StatusCode::OK), b"y"));
        match filter.decode(&Method::GET, "a.com", "/y", &none) {
            FilterDecision::Hit(response) => assert_eq!(response.body, "y"),
            _ => panic!("Should have been a hit"),
        }

        let uncoalesced = CacheFilter::new(cache, pool.next(), false);
        assert!(matches!(
            uncoalesced.decode(&Method::GET, "a.com", "/z", &none),
            FilterDecision::Fetch
        ));

        drop(leader);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_relay_feeds_waiters_client_and_cache() {
        let pool = WorkerPool::new(2).unwrap();
        let cache = ResponseCache::with_capacity(4).unwrap();
        let leader_filter = CacheFilter::new(cache.clone(), pool.next(), true);
        let waiter_filter = CacheFilter::new(cache.clone(), pool.next(), true);
        let none = HeaderMap::new();

        let guard = match leader_filter.decode(&Method::GET, "a.com", "/x", &none) {
            FilterDecision::Lead(guard) => guard,
            _ => panic!("Should have become leader"),
        };
        let waiting = match waiter_filter.decode(&Method::GET, "a.com", "/x", &none) {
            FilterDecision::Wait(stream) => stream,
            _ => panic!("Should have waited"),
        };

        let relay = UpstreamRelay::new(cache.clone(), "a.com", "/x", Some(guard));
        let body = relay_ready(
            relay,
            StatusCode::OK,
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))],
        )
        .await;

        assert_eq!(collect(body).await.unwrap(), "abcd");

        let response = waiting.into_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_CACHE], "COALESCED");
        assert_eq!(collect(response.into_body()).await.unwrap(), "abcd");

        assert_eq!(cache.get("a.com", "/x").unwrap().body, "abcd");
        assert!(cache.groups().get("a.com/x").is_none());
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_relay_error_resets_waiters() {
        let pool = WorkerPool::new(1).unwrap();
        let cache = ResponseCache::with_capacity(4).unwrap();
        let filter = CacheFilter::new(cache.clone(), pool.next(), true);
        let none = HeaderMap::new();

        let guard = match filter.decode(&Method::GET, "a.com", "/x", &none) {
            FilterDecision::Lead(guard) => guard,
            _ => panic!("Should have become leader"),
        };
        let mut waiting = match filter.decode(&Method::GET, "a.com", "/x", &none) {
            FilterDecision::Wait(stream) => stream,
            _ => panic!("Should have waited"),
        };

        let relay = UpstreamRelay::new(cache.clone(), "a.com", "/x", Some(guard));
        let body = relay_ready(
            relay,
            StatusCode::OK,
            vec![
                Ok(Bytes::from_static(b"ab")),
                Err(CacheError::OriginError("connection reset".to_string())),
            ],
        )
        .await;
        assert!(collect(body).await.is_err());

        assert!(matches!(waiting.recv().await, Some(Delivery::Headers { .. })));
        assert!(matches!(waiting.recv().await, Some(Delivery::Body { .. })));
        assert!(matches!(waiting.recv().await, Some(Delivery::Reset)));

        assert!(cache.get("a.com", "/x").is_none());
        assert!(cache.groups().get("a.com/x").is_none());
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_uncoalesced_fetch_stores_success_only() {
        let cache = ResponseCache::with_capacity(4).unwrap();

        let body = relay_ready(
            UpstreamRelay::new(cache.clone(), "a.com", "/ok", None),
            StatusCode::OK,
            vec![Ok(Bytes::from_static(b"fine"))],
        )
        .await;
        assert_eq!(collect(body).await.unwrap(), "fine");

        let body = relay_ready(
            UpstreamRelay::new(cache.clone(), "a.com", "/missing", None),
            StatusCode::NOT_FOUND,
            vec![Ok(Bytes::from_static(b"nope"))],
        )
        .await;
        assert_eq!(collect(body).await.unwrap(), "nope");

        // The client body only ends once the relay has stored and returned
        assert_eq!(cache.get("a.com", "/ok").unwrap().body, "fine");
        assert!(cache.get("a.com", "/missing").is_none());
    }

    #[tokio::test]
    async fn test_leader_client_gone_before_headers_keeps_fetch() {
        let pool = WorkerPool::new(2).unwrap();
        let cache = ResponseCache::with_capacity(4).unwrap();
        let filter = CacheFilter::new(cache.clone(), pool.next(), true);
        let none = HeaderMap::new();

        let guard = match filter.decode(&Method::GET, "a.com", "/slow", &none) {
            FilterDecision::Lead(guard) => guard,
            _ => panic!("Should have become leader"),
        };
        let waiting = match filter.decode(&Method::GET, "a.com", "/slow", &none) {
            FilterDecision::Wait(stream) => stream,
            _ => panic!("Should have waited"),
        };

        // The origin holds back its response until the leader's client is gone
        let (origin_tx, origin_rx) = oneshot::channel::<OriginResponse>();
        let relay = UpstreamRelay::new(cache.clone(), "a.com", "/slow", Some(guard));
        let pending = relay.spawn(async move {
            origin_rx
                .await
                .map_err(|_| CacheError::OriginUnreachable("origin went away".to_string()))
        });

        // A cancelled leader handler only drops its receiver
        let leader = tokio::spawn(async move { pending.await });
        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        assert_eq!(cache.coalesce_stats().in_flight_groups, 1);

        let response = OriginResponse {
            head: head(StatusCode::OK),
            body: upstream(vec![Ok(Bytes::from_static(b"fresh"))]),
        };
        assert!(origin_tx.send(response).is_ok());

        let response = waiting.into_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(collect(response.into_body()).await.unwrap(), "fresh");
        assert_eq!(cache.get("a.com", "/slow").unwrap().body, "fresh");
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_fetch_error_reaches_leader_and_resets_waiters() {
        let pool = WorkerPool::new(1).unwrap();
        let cache = ResponseCache::with_capacity(4).unwrap();
        let filter = CacheFilter::new(cache.clone(), pool.next(), true);
        let none = HeaderMap::new();

        let guard = match filter.decode(&Method::GET, "a.com", "/x", &none) {
            FilterDecision::Lead(guard) => guard,
            _ => panic!("Should have become leader"),
        };
        let waiting = match filter.decode(&Method::GET, "a.com", "/x", &none) {
            FilterDecision::Wait(stream) => stream,
            _ => panic!("Should have waited"),
        };

        let relay = UpstreamRelay::new(cache.clone(), "a.com", "/x", Some(guard));
        let result = relay
            .spawn(async { Err(CacheError::OriginUnreachable("refused".to_string())) })
            .await
            .unwrap();
        assert!(matches!(result, Err(CacheError::OriginUnreachable(_))));

        let err = waiting.into_response().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(cache.groups().get("a.com/x").is_none());
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_reset_before_headers_is_bad_gateway() {
        let pool = WorkerPool::new(1).unwrap();
        let (waiter, stream) = ChannelWaiter::channel(pool.next());
        waiter.deliver_reset();

        let err = stream.into_response().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        pool.shutdown();
    }
}
