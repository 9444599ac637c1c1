//! Prometheus metrics collection and export.
//!
//! All counters and gauges live in one global registry initialized at
//! startup and shared across tasks; recording helpers are static so the
//! request path never threads a metrics handle around.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

/// Labels for proxied request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Logical service name (or "unknown" for unrouted requests).
    pub service: String,
    /// HTTP method.
    pub method: String,
    /// Response status code.
    pub status: String,
}

/// Labels for request duration histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DurationLabels {
    pub service: String,
    pub method: String,
}

/// Labels for per-backend gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the proxy core.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<DurationLabels, Histogram>,
    active_connections: Family<BackendLabels, Gauge<i64, AtomicI64>>,
    backend_health: Family<BackendLabels, Gauge<i64, AtomicI64>>,
    gossip_nodes: Gauge<i64, AtomicI64>,
    config_reloads_total: Counter,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        // prometheus-client appends the `_total` suffix to counters on
        // encode, so counters register without it.
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "fluxgate_requests",
            "Total number of HTTP requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<DurationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 13))
            });
        registry.register(
            "fluxgate_request_duration_seconds",
            "Duration of HTTP requests in seconds",
            request_duration_seconds.clone(),
        );

        let active_connections = Family::<BackendLabels, Gauge<i64, AtomicI64>>::default();
        registry.register(
            "fluxgate_active_connections",
            "Number of active connections per backend",
            active_connections.clone(),
        );

        let backend_health = Family::<BackendLabels, Gauge<i64, AtomicI64>>::default();
        registry.register(
            "fluxgate_backend_health",
            "Health status of backends (1 = healthy, 0 = unhealthy)",
            backend_health.clone(),
        );

        let gossip_nodes = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "fluxgate_gossip_nodes",
            "Number of registered instances known via gossip",
            gossip_nodes.clone(),
        );

        let config_reloads_total = Counter::default();
        registry.register(
            "fluxgate_config_reloads",
            "Total number of configuration reloads",
            config_reloads_total.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            active_connections,
            backend_health,
            gossip_nodes,
            config_reloads_total,
        }
    }

    /// Records a completed request: counter plus duration histogram.
    pub fn record_request(service: &str, method: &str, status: u16, duration_secs: f64) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .requests_total
                .get_or_create(&RequestLabels {
                    service: service.to_string(),
                    method: method.to_string(),
                    status: status.to_string(),
                })
                .inc();
            metrics
                .request_duration_seconds
                .get_or_create(&DurationLabels {
                    service: service.to_string(),
                    method: method.to_string(),
                })
                .observe(duration_secs);
        }
    }

    /// Records a request counter tick without a duration observation.
    pub fn record_status(service: &str, method: &str, status: u16) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .requests_total
                .get_or_create(&RequestLabels {
                    service: service.to_string(),
                    method: method.to_string(),
                    status: status.to_string(),
                })
                .inc();
        }
    }

    pub fn inc_active_connections(backend: &str) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .active_connections
                .get_or_create(&BackendLabels {
                    backend: backend.to_string(),
                })
                .inc();
        }
    }

    pub fn dec_active_connections(backend: &str) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .active_connections
                .get_or_create(&BackendLabels {
                    backend: backend.to_string(),
                })
                .dec();
        }
    }

    /// Sets the per-backend health gauge (1 healthy, 0 unhealthy).
    pub fn set_backend_health(backend: &str, healthy: bool) {
        if let Ok(metrics) = METRICS.lock() {
            metrics
                .backend_health
                .get_or_create(&BackendLabels {
                    backend: backend.to_string(),
                })
                .set(i64::from(healthy));
        }
    }

    /// Sets the total number of instances visible through the registry.
    pub fn set_gossip_nodes(count: i64) {
        if let Ok(metrics) = METRICS.lock() {
            metrics.gossip_nodes.set(count);
        }
    }

    pub fn inc_config_reloads() {
        if let Ok(metrics) = METRICS.lock() {
            metrics.config_reloads_total.inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        Metrics::record_request("users", "GET", 200, 0.05);
        Metrics::record_request("users", "POST", 201, 0.1);

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("fluxgate_requests_total"));
        assert!(encoded.contains("fluxgate_request_duration_seconds"));
    }

    #[test]
    fn test_websocket_status_label() {
        Metrics::record_status("ws-service", "GET", 101);

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("status=\"101\""));
    }

    #[test]
    fn test_backend_gauges() {
        Metrics::inc_active_connections("http://127.0.0.1:9001/");
        Metrics::set_backend_health("http://127.0.0.1:9001/", false);
        Metrics::dec_active_connections("http://127.0.0.1:9001/");

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("fluxgate_active_connections"));
        assert!(encoded.contains("fluxgate_backend_health"));
    }

    #[test]
    fn test_cluster_counters() {
        Metrics::set_gossip_nodes(4);
        Metrics::inc_config_reloads();

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("fluxgate_gossip_nodes"));
        assert!(encoded.contains("fluxgate_config_reloads_total"));
    }
}
