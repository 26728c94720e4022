use axum::http::StatusCode;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

use crate::cache::CacheStatus;

pub struct Metrics {
    registry: Registry,
    requests_total: CounterVec,
    request_duration: HistogramVec,
    origin_requests: CounterVec,
    coalesced_waiters: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("ringcache_requests_total", "Total number of proxied requests"),
            &["host", "status", "cache_status"],
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "ringcache_request_duration_seconds",
                "Time until the response head was ready, in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["host", "cache_status"],
        )?;

        let origin_requests = CounterVec::new(
            Opts::new(
                "ringcache_origin_requests_total",
                "Total requests sent upstream",
            ),
            &["host", "status"],
        )?;

        let coalesced_waiters = CounterVec::new(
            Opts::new(
                "ringcache_coalesced_waiters_total",
                "Requests served by replaying another request's fetch",
            ),
            &["host"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(origin_requests.clone()))?;
        registry.register(Box::new(coalesced_waiters.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            origin_requests,
            coalesced_waiters,
        })
    }

    pub fn record_request(
        &self,
        host: &str,
        cache_status: CacheStatus,
        status: StatusCode,
        duration: Duration,
    ) {
        let status_str = status.as_u16().to_string();
        let cache_str = cache_status.as_str();

        self.requests_total
            .with_label_values(&[host, status_str.as_str(), cache_str])
            .inc();

        self.request_duration
            .with_label_values(&[host, cache_str])
            .observe(duration.as_secs_f64());

        if cache_status == CacheStatus::Coalesced {
            self.coalesced_waiters.with_label_values(&[host]).inc();
        }
    }

    pub fn record_origin_request(&self, host: &str, status: StatusCode) {
        let status_str = status.as_u16().to_string();
        self.origin_requests
            .with_label_values(&[host, status_str.as_str()])
            .inc();
    }

    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request(
            "a.com",
            CacheStatus::Coalesced,
            StatusCode::OK,
            Duration::from_millis(3),
        );
        metrics.record_origin_request("a.com", StatusCode::OK);

        let text = metrics.gather();
        assert!(text.contains("ringcache_requests_total"));
        assert!(text.contains("cache_status=\"COALESCED\""));
        assert!(text.contains("ringcache_coalesced_waiters_total"));
        assert!(text.contains("ringcache_origin_requests_total"));
    }
}
