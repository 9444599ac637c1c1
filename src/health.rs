//! Active health probing of registered backends.
//!
//! Every tick, each known backend gets a GET to its health path with a
//! timeout strictly shorter than the interval, so probes of one backend
//! never overlap. Only a 200 counts as healthy; redirects are not
//! followed. State transitions flip the pool's active flag and the
//! backend health gauge.

use crate::loadbalancer::{Backend, LoadBalancer};
use crate::metrics::Metrics;
use http::{Request, StatusCode, Uri};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

struct HealthEndpoint {
    backend: Arc<Backend>,
    pool: Arc<dyn LoadBalancer>,
}

/// Periodic prober for every backend in every pool.
pub struct HealthChecker {
    client: Client<HttpConnector, Empty<Bytes>>,
    interval: Duration,
    probe_timeout: Duration,
    path: String,
    endpoints: RwLock<HashMap<String, HealthEndpoint>>,
}

impl HealthChecker {
    /// Creates a checker; config validation guarantees
    /// `probe_timeout < interval`.
    pub fn new(interval: Duration, probe_timeout: Duration, path: impl Into<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            interval,
            probe_timeout,
            path: path.into(),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the probed endpoint set with the backends of the given
    /// pools. Called by the reactive wiring after every pool rebuild.
    pub fn resync(&self, pools: &[Arc<dyn LoadBalancer>]) {
        let mut endpoints = HashMap::new();
        for pool in pools {
            for backend in pool.backends() {
                endpoints.insert(
                    backend.url.to_string(),
                    HealthEndpoint {
                        backend,
                        pool: Arc::clone(pool),
                    },
                );
            }
        }
        *self.endpoints.write() = endpoints;
    }

    /// Number of backends currently being probed.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Probes all backends every interval until shutdown. Each backend
    /// is probed in its own task.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all(),
                _ = shutdown.recv() => {
                    debug!("health checker stopping");
                    break;
                }
            }
        }
    }

    fn check_all(&self) {
        let targets: Vec<(String, Arc<Backend>, Arc<dyn LoadBalancer>)> = {
            let endpoints = self.endpoints.read();
            endpoints
                .values()
                .map(|e| (e.backend.url.to_string(), Arc::clone(&e.backend), Arc::clone(&e.pool)))
                .collect()
        };

        for (url, backend, pool) in targets {
            let checker = self.clone_probe_state();
            tokio::spawn(async move {
                let healthy = checker.probe(&url).await;
                Self::apply(&url, healthy, &backend, &pool);
            });
        }
    }

    fn clone_probe_state(&self) -> ProbeClient {
        ProbeClient {
            client: self.client.clone(),
            timeout: self.probe_timeout,
            path: self.path.clone(),
        }
    }

    fn apply(url: &str, healthy: bool, backend: &Arc<Backend>, pool: &Arc<dyn LoadBalancer>) {
        if healthy == backend.is_active() {
            return;
        }
        if healthy {
            info!(backend = %url, "backend is now healthy");
            pool.mark_healthy(backend);
        } else {
            warn!(backend = %url, "backend is now unhealthy");
            pool.mark_unhealthy(backend);
        }
        Metrics::set_backend_health(url, healthy);
    }
}

#[derive(Clone)]
struct ProbeClient {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
    path: String,
}

impl ProbeClient {
    /// One probe: GET `{backend}{path}`, 200 within the timeout counts
    /// as healthy, anything else (status, transport error, timeout)
    /// does not. The client never follows redirects, so only the final
    /// status matters.
    async fn probe(&self, backend_url: &str) -> bool {
        let url = format!("{}{}", backend_url.trim_end_matches('/'), self.path);
        let uri: Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(url = %url, error = %e, "invalid health probe url");
                return false;
            }
        };

        let request = match Request::get(uri).body(Empty::<Bytes>::new()) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "failed to build health probe request");
                return false;
            }
        };

        match timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response.status() == StatusCode::OK,
            Ok(Err(e)) => {
                debug!(backend = %backend_url, error = %e, "health probe transport error");
                false
            }
            Err(_) => {
                debug!(backend = %backend_url, "health probe timed out");
                false
            }
        }
    }
}
