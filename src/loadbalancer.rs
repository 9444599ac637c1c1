//! Backend pools with pluggable selection policies.
//!
//! A pool owns the backends for one service. `next()` is called on the
//! request path and must stay lock-light: it takes the read lock only,
//! and all counters are atomics.

use http::Uri;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Runtime twin of a registered instance inside a pool.
#[derive(Debug)]
pub struct Backend {
    /// Parsed backend URL, e.g. `http://127.0.0.1:9001`.
    pub url: Uri,
    /// Weight from registration metadata. Stored for forward
    /// compatibility; neither policy consults it yet.
    pub weight: u32,
    active: AtomicBool,
    connections: AtomicI64,
}

impl Backend {
    /// Creates an active backend with zero in-flight connections.
    pub fn new(url: Uri, weight: u32) -> Self {
        Self {
            url,
            weight,
            active: AtomicBool::new(true),
            connections: AtomicI64::new(0),
        }
    }

    /// Whether the backend is currently eligible for selection.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Current in-flight connection count.
    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    fn acquire(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Selection policy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RoundRobin,
    LeastConnection,
}

/// A load-balanced pool of backends for one service.
///
/// All operations are safe for concurrent use.
pub trait LoadBalancer: Send + Sync {
    /// The policy this pool selects with; pool rebuilds preserve it.
    fn policy(&self) -> Policy;

    /// Appends a backend to the pool.
    fn add(&self, backend: Arc<Backend>);

    /// Drops the first backend whose URL matches.
    fn remove(&self, url: &Uri);

    /// Selects the next active backend, or `None` if every backend is
    /// inactive or the pool is empty.
    fn next(&self) -> Option<Arc<Backend>>;

    /// Releases a backend acquired by `next()` at request end.
    fn release(&self, backend: &Backend);

    fn mark_healthy(&self, backend: &Backend);

    fn mark_unhealthy(&self, backend: &Backend);

    /// Snapshot of every backend, active or not.
    fn backends(&self) -> Vec<Arc<Backend>>;
}

/// Creates an empty pool of the given policy.
pub fn new_pool(policy: Policy) -> Arc<dyn LoadBalancer> {
    match policy {
        Policy::RoundRobin => Arc::new(RoundRobin::new()),
        Policy::LeastConnection => Arc::new(LeastConnection::new()),
    }
}

/// Round-robin selection over the active subset.
///
/// The counter is monotonic across pool membership changes, so balance
/// is only asymptotically uniform while the live set shifts.
pub struct RoundRobin {
    backends: RwLock<Vec<Arc<Backend>>>,
    current: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            current: AtomicU64::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobin {
    fn policy(&self) -> Policy {
        Policy::RoundRobin
    }

    fn add(&self, backend: Arc<Backend>) {
        self.backends.write().push(backend);
    }

    fn remove(&self, url: &Uri) {
        let mut backends = self.backends.write();
        if let Some(pos) = backends.iter().position(|b| b.url == *url) {
            backends.remove(pos);
        }
    }

    fn next(&self) -> Option<Arc<Backend>> {
        let backends = self.backends.read();
        let active: Vec<&Arc<Backend>> = backends.iter().filter(|b| b.is_active()).collect();
        if active.is_empty() {
            return None;
        }
        let n = self.current.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(active[(n % active.len() as u64) as usize]))
    }

    fn release(&self, _backend: &Backend) {}

    fn mark_healthy(&self, backend: &Backend) {
        backend.set_active(true);
    }

    fn mark_unhealthy(&self, backend: &Backend) {
        backend.set_active(false);
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }
}

/// Least-connection selection: lowest in-flight count wins, ties broken
/// by insertion order. Selection increments the counter; `release`
/// decrements it at request end.
pub struct LeastConnection {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl LeastConnection {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
        }
    }
}

impl Default for LeastConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastConnection {
    fn policy(&self) -> Policy {
        Policy::LeastConnection
    }

    fn add(&self, backend: Arc<Backend>) {
        backend.set_active(true);
        self.backends.write().push(backend);
    }

    fn remove(&self, url: &Uri) {
        let mut backends = self.backends.write();
        if let Some(pos) = backends.iter().position(|b| b.url == *url) {
            backends.remove(pos);
        }
    }

    fn next(&self) -> Option<Arc<Backend>> {
        let backends = self.backends.read();
        let mut selected: Option<&Arc<Backend>> = None;
        let mut min_connections = i64::MAX;

        for backend in backends.iter() {
            if backend.is_active() && backend.connections() < min_connections {
                min_connections = backend.connections();
                selected = Some(backend);
            }
        }

        selected.map(|backend| {
            backend.acquire();
            Arc::clone(backend)
        })
    }

    fn release(&self, backend: &Backend) {
        backend.release();
    }

    fn mark_healthy(&self, backend: &Backend) {
        backend.set_active(true);
    }

    fn mark_unhealthy(&self, backend: &Backend) {
        backend.set_active(false);
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }
}
