use std::time::Duration;

use prometheus::{
    core::Collector, opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    upstream_errors_total: IntCounterVec,
    chunks_relayed_total: IntCounter,
    client_disconnects_total: IntCounter,
}

pub struct InflightGuard<'a> {
    metrics: &'a RelayMetrics,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "relay_http_requests_total",
                "Total HTTP requests handled by the relay"
            ),
            &["path", "method", "status"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_http_request_duration_seconds",
                "Time until response headers were ready, in seconds",
            ),
            &["path", "method"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "relay_inflight_requests",
            "Requests currently being prepared by the relay",
        )
        .expect("valid inflight_requests metric");

        let upstream_errors_total = IntCounterVec::new(
            opts!(
                "relay_upstream_errors_total",
                "Upstream failures by stage"
            ),
            &["stage"],
        )
        .expect("valid upstream_errors_total metric");

        let chunks_relayed_total = IntCounter::new(
            "relay_chunks_relayed_total",
            "Normalized chunks handed to client connections",
        )
        .expect("valid chunks_relayed_total metric");

        let client_disconnects_total = IntCounter::new(
            "relay_client_disconnects_total",
            "Streams abandoned by the client before completion",
        )
        .expect("valid client_disconnects_total metric");

        let collectors: [Box<dyn Collector>; 6] = [
            Box::new(request_total.clone()),
            Box::new(request_duration_seconds.clone()),
            Box::new(inflight_requests.clone()),
            Box::new(upstream_errors_total.clone()),
            Box::new(chunks_relayed_total.clone()),
            Box::new(client_disconnects_total.clone()),
        ];
        for collector in collectors {
            // Names above are distinct, so a fresh registry accepts each one.
            registry
                .register(collector)
                .expect("relay metric names are unique");
        }

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            upstream_errors_total,
            chunks_relayed_total,
            client_disconnects_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_upstream_error(&self, stage: &str) {
        self.upstream_errors_total.with_label_values(&[stage]).inc();
    }

    pub fn observe_chunk_relayed(&self) {
        self.chunks_relayed_total.inc();
    }

    pub fn observe_client_disconnect(&self) {
        self.client_disconnects_total.inc();
    }

    pub fn chunks_relayed(&self) -> u64 {
        self.chunks_relayed_total.get()
    }

    pub fn client_disconnects(&self) -> u64 {
        self.client_disconnects_total.get()
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_relay_counters() {
        let metrics = RelayMetrics::new();
        metrics.observe_request("/chat", "POST", 200, Duration::from_millis(3));
        metrics.observe_upstream_error("open");
        metrics.observe_chunk_relayed();

        let rendered = metrics.render().expect("metrics render");
        assert!(rendered.contains("relay_http_requests_total"));
        assert!(rendered.contains("stage=\"open\""));
        assert_eq!(metrics.chunks_relayed(), 1);
    }

    #[test]
    fn every_relay_family_is_registered() {
        let metrics = RelayMetrics::new();
        metrics.observe_request("/health", "GET", 200, Duration::from_millis(1));
        metrics.observe_upstream_error("read");

        let mut names = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(
            names,
            [
                "relay_chunks_relayed_total",
                "relay_client_disconnects_total",
                "relay_http_request_duration_seconds",
                "relay_http_requests_total",
                "relay_inflight_requests",
                "relay_upstream_errors_total",
            ]
        );
    }

    #[test]
    fn inflight_guard_restores_gauge() {
        let metrics = RelayMetrics::new();
        {
            let _guard = metrics.inflight_guard();
            assert_eq!(metrics.inflight_requests.get(), 1);
        }
        assert_eq!(metrics.inflight_requests.get(), 0);
    }
}
