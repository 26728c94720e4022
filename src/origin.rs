use axum::http::{HeaderMap, HeaderName, header};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, Response};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::OriginConfig;
use crate::error::{CacheError, CacheResult};
use crate::response::ResponseHead;

pub type BodyStream = BoxStream<'static, CacheResult<Bytes>>;

/// Upstream response whose body has not been read yet
pub struct OriginResponse {
    pub head: ResponseHead,
    pub body: BodyStream,
}

/// Request headers passed through to the upstream
const FORWARDED_REQUEST_HEADERS: [HeaderName; 3] =
    [header::ACCEPT, header::ACCEPT_LANGUAGE, header::USER_AGENT];

/// Connection-level headers that must not be relayed
const HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub struct OriginFetcher {
    client: Client,
    origins: HashMap<String, OriginConfig>,
}

impl OriginFetcher {
    pub fn new(origins: HashMap<String, OriginConfig>) -> CacheResult<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CacheError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        info!(origins = origins.len(), "Initialized upstream HTTP client");

        Ok(Self { client, origins })
    }

    /// Find the upstream for a request host. With a single configured
    /// origin, that origin serves every host.
    pub fn resolve(&self, host: &str) -> CacheResult<(&str, &OriginConfig)> {
        if let Some((name, origin)) = self.origins.get_key_value(host) {
            return Ok((name.as_str(), origin));
        }

        if self.origins.len() == 1 {
            if let Some((name, origin)) = self.origins.iter().next() {
                return Ok((name.as_str(), origin));
            }
        }

        Err(CacheError::NotFound(format!("Unknown host: {}", host)))
    }

    /// Send the request upstream and return once the response head arrives.
    /// Connection-phase failures are retried with exponential backoff; body
    /// errors surface through the returned stream.
    pub async fn fetch(
        &self,
        host: &str,
        path: &str,
        request_headers: &HeaderMap,
    ) -> CacheResult<OriginResponse> {
        let (origin_name, origin) = self.resolve(host)?;
        let url = build_url(&origin.url, path);

        info!(origin = %origin_name, url = %url, "Fetching from upstream");

        let mut attempt = 0;
        let max_retries = origin.max_retries.max(1);

        loop {
            attempt += 1;

            match self.do_fetch(&url, origin, request_headers).await {
                Ok(response) => return Ok(into_origin_response(response)),
                Err(e) => {
                    if attempt >= max_retries {
                        error!(
                            origin = %origin_name,
                            attempt = attempt,
                            error = %e,
                            "All upstream fetch attempts failed"
                        );
                        return Err(e);
                    }

                    warn!(
                        origin = %origin_name,
                        attempt = attempt,
                        max_retries = max_retries,
                        error = %e,
                        "Upstream fetch failed, retrying"
                    );

                    // Exponential backoff
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn do_fetch(
        &self,
        url: &str,
        origin: &OriginConfig,
        request_headers: &HeaderMap,
    ) -> CacheResult<Response> {
        let mut request = self.client.get(url).timeout(origin.timeout());

        // Forward configured headers
        for (key, value) in &origin.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        for name in FORWARDED_REQUEST_HEADERS {
            for value in request_headers.get_all(&name) {
                request = request.header(name.clone(), value.clone());
            }
        }

        Ok(request.send().await?)
    }
}

fn into_origin_response(response: Response) -> OriginResponse {
    let status = response.status();
    let headers = strip_hop_by_hop(response.headers());

    debug!(
        status = status.as_u16(),
        content_length = ?response.content_length(),
        "Received upstream response head"
    );

    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(CacheError::from))
        .boxed();

    OriginResponse {
        head: ResponseHead::new(status, headers),
        body,
    }
}

/// Copy `headers` without connection-scoped fields, including any named by
/// the `Connection` header itself.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP_HEADERS.contains(name)
            || name.as_str() == "keep-alive"
            || named.iter().any(|n| n == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn build_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn origin(url: &str) -> OriginConfig {
        OriginConfig {
            url: url.to_string(),
            timeout_secs: 5,
            max_retries: 1,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_build_url() {
        assert_eq!(build_url("http://up:8000/", "/a?b=1"), "http://up:8000/a?b=1");
        assert_eq!(build_url("http://up:8000", "a"), "http://up:8000/a");
    }

    #[test]
    fn test_resolve() {
        let mut origins = HashMap::new();
        origins.insert("a.com".to_string(), origin("http://127.0.0.1:1"));
        let fetcher = OriginFetcher::new(origins.clone()).unwrap();

        // A single origin serves every host
        assert_eq!(fetcher.resolve("a.com").unwrap().0, "a.com");
        assert_eq!(fetcher.resolve("other.com").unwrap().0, "a.com");

        origins.insert("b.com".to_string(), origin("http://127.0.0.1:2"));
        let fetcher = OriginFetcher::new(origins).unwrap();
        assert_eq!(fetcher.resolve("b.com").unwrap().0, "b.com");
        assert!(matches!(
            fetcher.resolve("other.com"),
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.get(header::TRANSFER_ENCODING).is_none());
        assert!(stripped.get(header::CONNECTION).is_none());
        assert!(stripped.get("keep-alive").is_none());
        assert!(stripped.get("x-private").is_none());
        assert_eq!(stripped.get_all(header::SET_COOKIE).iter().count(), 2);
        assert_eq!(stripped.get(header::CONTENT_TYPE).unwrap(), "text/html");
    }
}
