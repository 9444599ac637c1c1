//! Reverse proxy engine: the data-plane request pipeline, the reactive
//! wiring from registry snapshots to route/pool state, and the server
//! accept loop.
//!
//! Pipeline per request: route match (404) → pool resolve (500) →
//! backend select (503) → connection accounting → prefix strip →
//! WebSocket-or-HTTP dispatch → metrics.

use crate::api;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::health::HealthChecker;
use crate::loadbalancer::{new_pool, Backend, LoadBalancer, Policy};
use crate::metrics::Metrics;
use crate::registry::{Registry, ServiceInstance, ServiceMap};
use crate::router::Router;
use crate::tls::TlsManager;
use crate::websocket;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use http::header::HeaderValue;
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Methods accepted by dynamically created service routes.
const ROUTE_METHODS: [Method; 6] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
];

/// The proxy server: control API, data plane, and registry wiring.
pub struct ProxyServer {
    config: Arc<Config>,
    registry: Arc<Registry>,
    router: Arc<Router>,
    health: Arc<HealthChecker>,
    tls: Arc<TlsManager>,
    pools: DashMap<String, Arc<dyn LoadBalancer>>,
    proxies: RwLock<HashMap<String, Arc<ReverseProxy>>>,
    client: Client<HttpConnector, Incoming>,
    tcp_listener: TcpListener,
    addr: SocketAddr,
}

impl ProxyServer {
    /// Binds the proxy listener and subscribes to registry changes.
    pub async fn bind(
        addr: &str,
        config: Arc<Config>,
        registry: Arc<Registry>,
        health: Arc<HealthChecker>,
        tls: Arc<TlsManager>,
    ) -> Result<Arc<Self>> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        // Shared upstream transport: dial timeout follows the read
        // timeout, idle connections are pooled per backend host.
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeouts.read()));
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        let server = Arc::new(Self {
            config,
            registry,
            router: Arc::new(Router::new()),
            health,
            tls,
            pools: DashMap::new(),
            proxies: RwLock::new(HashMap::new()),
            client,
            tcp_listener,
            addr: local_addr,
        });
        server.wire();

        info!(addr = %local_addr, "proxy listener bound");
        Ok(server)
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Subscribes the wiring to registry notifications. The listener
    /// holds only a weak reference, so the registry never keeps the
    /// server alive.
    fn wire(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.registry.subscribe(move |services| {
            if let Some(server) = weak.upgrade() {
                server.apply_services(services);
            }
        });
    }

    /// Rebuilds pools and route entries from a registry snapshot, then
    /// resyncs the health checker's endpoint set.
    ///
    /// Routes are never removed when a service disappears: an empty
    /// pool answers 503 instead of 404 during momentary outages.
    fn apply_services(&self, services: ServiceMap) {
        for (service, instances) in &services {
            self.rebuild_pool(service, instances);
        }

        // A service pruned from the registry keeps its route; its pool
        // is emptied so requests answer 503 instead of reaching dead
        // backends.
        let vanished: Vec<String> = self
            .pools
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|service| !services.contains_key(service))
            .collect();
        for service in vanished {
            self.rebuild_pool(&service, &[]);
        }

        let total: usize = services.values().map(Vec::len).sum();
        Metrics::set_gossip_nodes(total as i64);

        let pools: Vec<Arc<dyn LoadBalancer>> =
            self.pools.iter().map(|e| Arc::clone(e.value())).collect();
        self.health.resync(&pools);

        debug!(services = services.len(), instances = total, "applied registry update");
    }

    fn rebuild_pool(&self, service: &str, instances: &[ServiceInstance]) {
        let policy = match self.pools.entry(service.to_string()) {
            Entry::Occupied(entry) => entry.get().policy(),
            Entry::Vacant(entry) => {
                entry.insert(new_pool(Policy::RoundRobin));
                let pattern = format!("/{service}/*");
                self.router
                    .add_route(pattern.clone(), service, ROUTE_METHODS.to_vec());
                info!(service, route = %pattern, "added dynamic route");
                Policy::RoundRobin
            }
        };

        // Fresh pool of the same variant; in-flight requests holding a
        // backend from the old pool drain naturally.
        let fresh = new_pool(policy);
        for instance in instances {
            let url: Uri = match instance.backend_url().parse() {
                Ok(url) => url,
                Err(_) => {
                    warn!(service, url = %instance.backend_url(), "skipping invalid backend url");
                    continue;
                }
            };
            fresh.add(Arc::new(Backend::new(url, instance.weight())));
        }
        self.pools.insert(service.to_string(), fresh);
    }

    /// Serves connections until a shutdown signal is received.
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(addr = %self.addr, tls = self.tls.is_enabled(), "serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    debug!(peer = %peer_addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("received shutdown signal, stopping proxy listener");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        match self.tls.acceptor() {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await.map_err(ProxyError::Io)?;
                self.serve_http(TokioIo::new(tls_stream)).await
            }
            None => self.serve_http(TokioIo::new(stream)).await,
        }
    }

    async fn serve_http<I>(self: Arc<Self>, io: I) -> Result<()>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let server = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let server = Arc::clone(&server);
            async move { server.handle_request(req).await }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.timeouts.read())
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(ProxyError::Http)
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        if req.uri().path().starts_with("/api/v1/") {
            return Ok(api::handle_control(&self, req).await);
        }
        Ok(self.proxy_request(req).await)
    }

    /// The data-plane pipeline.
    async fn proxy_request(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let start = Instant::now();
        let method = req.method().clone();

        let Some(route) = self.router.match_route(req.method(), req.uri().path()) else {
            Metrics::record_status("unknown", method.as_str(), 404);
            return error_response(StatusCode::NOT_FOUND, "No route found");
        };

        let Some(pool) = self
            .pools
            .get(&route.service)
            .map(|entry| Arc::clone(entry.value()))
        else {
            Metrics::record_status(&route.service, method.as_str(), 500);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Service not configured");
        };

        let Some(backend) = pool.next() else {
            Metrics::record_status(&route.service, method.as_str(), 503);
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "No healthy backends");
        };

        let guard = ConnectionGuard::new(Arc::clone(&backend), Arc::clone(&pool));
        let req = rewrite_path(req, &route.service);

        if websocket::is_websocket_upgrade(req.headers()) {
            return match websocket::proxy_websocket(req, &backend.url, guard).await {
                Ok(response) => {
                    Metrics::record_status(
                        &route.service,
                        method.as_str(),
                        response.status().as_u16(),
                    );
                    response
                }
                Err(e) => {
                    warn!(backend = %backend.url, error = %e, "websocket proxy error");
                    Metrics::record_status(&route.service, method.as_str(), 502);
                    error_response(StatusCode::BAD_GATEWAY, "Bad gateway")
                }
            };
        }

        let proxy = self.proxy_for(&backend.url);
        let response = match timeout(self.config.timeouts.read(), proxy.forward(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(backend = %backend.url, error = %e, "upstream request failed");
                let duration = start.elapsed().as_secs_f64();
                Metrics::record_request(&route.service, method.as_str(), 502, duration);
                return error_response(StatusCode::BAD_GATEWAY, "Bad gateway");
            }
            Err(_) => {
                warn!(backend = %backend.url, "upstream request timed out");
                let duration = start.elapsed().as_secs_f64();
                Metrics::record_request(&route.service, method.as_str(), 502, duration);
                return error_response(StatusCode::BAD_GATEWAY, "Bad gateway");
            }
        };

        let duration = start.elapsed().as_secs_f64();
        Metrics::record_request(
            &route.service,
            method.as_str(),
            response.status().as_u16(),
            duration,
        );

        let (mut parts, body) = response.into_parts();
        parts
            .headers
            .insert("x-proxy", HeaderValue::from_static("FluxGate"));
        let body = GuardedBody::new(body, guard).boxed();
        Response::from_parts(parts, body)
    }

    /// Looks up (or lazily creates) the memoized per-backend forwarder.
    /// Double-checked under the read lock so the hot path never takes
    /// the write lock.
    fn proxy_for(&self, backend_url: &Uri) -> Arc<ReverseProxy> {
        let key = backend_url.to_string();
        {
            let proxies = self.proxies.read();
            if let Some(proxy) = proxies.get(&key) {
                return Arc::clone(proxy);
            }
        }

        let proxy = Arc::new(ReverseProxy::new(backend_url.clone(), self.client.clone()));
        let mut proxies = self.proxies.write();
        Arc::clone(proxies.entry(key).or_insert(proxy))
    }
}

/// Strips the `/{service}` prefix once; an emptied path becomes `/`.
/// Query string and headers are untouched.
fn rewrite_path<B>(mut req: Request<B>, service: &str) -> Request<B> {
    let prefix = format!("/{service}");
    let original = req.uri().path().to_string();
    let Some(stripped) = original.strip_prefix(&prefix) else {
        return req;
    };
    let stripped = if stripped.is_empty() { "/" } else { stripped };

    let rewritten = match req.uri().query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped.to_string(),
    };
    match rewritten.parse::<Uri>() {
        Ok(uri) => {
            debug!(from = %original, to = %stripped, service, "path rewrite");
            *req.uri_mut() = uri;
        }
        Err(e) => warn!(error = %e, "failed to rewrite path"),
    }
    req
}

/// Per-backend HTTP forwarder sharing the pooled upstream transport.
struct ReverseProxy {
    target: Uri,
    client: Client<HttpConnector, Incoming>,
}

impl ReverseProxy {
    fn new(target: Uri, client: Client<HttpConnector, Incoming>) -> Self {
        Self { target, client }
    }

    async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<Incoming>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let scheme = self.target.scheme_str().unwrap_or("http");
        let authority = self
            .target
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();

        let uri = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(ProxyError::HttpBuild)?;
        *req.uri_mut() = uri;
        req.headers_mut().insert(
            http::header::HOST,
            HeaderValue::from_str(authority)
                .map_err(|e| ProxyError::HttpBuild(http::Error::from(e)))?,
        );

        Ok(self.client.request(req).await.map_err(|e| {
            ProxyError::UpstreamConnect {
                addr: self.target.to_string(),
                source: std::io::Error::other(e),
            }
        })?)
    }
}

/// Tracks one selected backend for the lifetime of a request: bumps the
/// active-connection gauge on creation, releases the pool slot and
/// gauge on drop (response completion or client disconnect).
pub struct ConnectionGuard {
    backend: Arc<Backend>,
    pool: Arc<dyn LoadBalancer>,
}

impl ConnectionGuard {
    pub(crate) fn new(backend: Arc<Backend>, pool: Arc<dyn LoadBalancer>) -> Self {
        Metrics::inc_active_connections(&backend.url.to_string());
        Self { backend, pool }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.pool.release(&self.backend);
        Metrics::dec_active_connections(&self.backend.url.to_string());
    }
}

/// Response body wrapper holding the connection guard until the body is
/// fully streamed or dropped.
struct GuardedBody {
    inner: Incoming,
    _guard: ConnectionGuard,
}

impl GuardedBody {
    fn new(inner: Incoming, guard: ConnectionGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Creates a plain-text HTTP error response.
pub(crate) fn error_response(
    status: StatusCode,
    message: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| {
            Response::new(
                Full::new(Bytes::new())
                    .map_err(|never| match never {})
                    .boxed(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;
    use std::collections::HashMap as StdHashMap;

    fn request(path: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .uri(path)
            .body(Empty::<Bytes>::new())
            .unwrap()
    }

    fn instance(id: &str, service: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            service: service.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            metadata: StdHashMap::new(),
        }
    }

    async fn test_server() -> Arc<ProxyServer> {
        let config = Arc::new(Config::default());
        let registry = Arc::new(Registry::new());
        let health = Arc::new(HealthChecker::new(
            Duration::from_secs(10),
            Duration::from_secs(5),
            "/health",
        ));
        let tls = Arc::new(TlsManager::new(None).unwrap());
        ProxyServer::bind("127.0.0.1:0", config, registry, health, tls)
            .await
            .unwrap()
    }

    #[test]
    fn test_rewrite_path_strips_prefix_once() {
        let req = rewrite_path(request("/users/profile/42"), "users");
        assert_eq!(req.uri().path(), "/profile/42");

        // A second pass over the already-stripped path is a no-op
        // unless the remainder happens to start with the prefix again.
        let req = rewrite_path(request("/users"), "users");
        assert_eq!(req.uri().path(), "/");
    }

    #[test]
    fn test_rewrite_path_preserves_query() {
        let req = rewrite_path(request("/users/search?q=bob&limit=2"), "users");
        assert_eq!(req.uri().path(), "/search");
        assert_eq!(req.uri().query(), Some("q=bob&limit=2"));
    }

    #[test]
    fn test_rewrite_path_without_prefix_untouched() {
        let req = rewrite_path(request("/orders/1"), "users");
        assert_eq!(req.uri().path(), "/orders/1");
    }

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, "No healthy backends");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wiring_creates_pool_and_route() {
        let server = test_server().await;

        let mut services = ServiceMap::new();
        services.insert(
            "users".to_string(),
            vec![instance("a1", "users", 9001), instance("a2", "users", 9002)],
        );
        server.apply_services(services);

        assert_eq!(server.pool_count(), 1);
        let pool = server.pools.get("users").unwrap();
        assert_eq!(pool.backends().len(), 2);

        let route = server
            .router
            .match_route(&Method::GET, "/users/anything")
            .unwrap();
        assert_eq!(route.service, "users");
        assert_eq!(server.health.endpoint_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wiring_rebuild_preserves_policy_and_route() {
        let server = test_server().await;

        let mut services = ServiceMap::new();
        services.insert("users".to_string(), vec![instance("a1", "users", 9001)]);
        server.apply_services(services);
        assert_eq!(server.router.len(), 1);

        // Second update: same route, fresh pool.
        let mut services = ServiceMap::new();
        services.insert("users".to_string(), vec![instance("a2", "users", 9002)]);
        server.apply_services(services);

        assert_eq!(server.router.len(), 1);
        let pool = server.pools.get("users").unwrap();
        assert_eq!(pool.policy(), Policy::RoundRobin);
        let backends = pool.backends();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].url.to_string(), "http://127.0.0.1:9002/");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_route_survives_service_disappearing() {
        let server = test_server().await;

        let mut services = ServiceMap::new();
        services.insert("users".to_string(), vec![instance("a1", "users", 9001)]);
        server.apply_services(services.clone());

        // Instance gone: the snapshot now carries an empty list for the
        // service, the route stays and the pool empties out.
        services.insert("users".to_string(), Vec::new());
        server.apply_services(services);

        assert!(server
            .router
            .match_route(&Method::GET, "/users/x")
            .is_some());
        let pool = server.pools.get("users").unwrap();
        assert!(pool.next().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_proxy_memoized_per_backend() {
        let server = test_server().await;
        let url: Uri = "http://127.0.0.1:9001".parse().unwrap();

        let first = server.proxy_for(&url);
        let second = server.proxy_for(&url);
        assert!(Arc::ptr_eq(&first, &second));

        let other = server.proxy_for(&"http://127.0.0.1:9002".parse().unwrap());
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
