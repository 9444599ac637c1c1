//! Dynamic route table mapping request paths to service names.
//!
//! Routes are matched first-fit in insertion order, which is observable:
//! a wildcard registered before a more specific pattern shadows it.

use http::Method;
use parking_lot::RwLock;

/// A single routing entry.
#[derive(Debug, Clone)]
pub struct Route {
    /// `/prefix/*` for wildcard matching or an exact path.
    pub pattern: String,
    /// Logical service the route resolves to.
    pub service: String,
    /// Allowed methods; empty means any.
    pub methods: Vec<Method>,
}

/// Thread-safe, insertion-ordered route table.
pub struct Router {
    routes: RwLock<Vec<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Appends a route. Later entries never shadow earlier ones.
    pub fn add_route(&self, pattern: impl Into<String>, service: impl Into<String>, methods: Vec<Method>) {
        self.routes.write().push(Route {
            pattern: pattern.into(),
            service: service.into(),
            methods,
        });
    }

    /// Finds the first route matching the request, if any.
    pub fn match_route(&self, method: &Method, path: &str) -> Option<Route> {
        let routes = self.routes.read();
        routes
            .iter()
            .find(|route| path_matches(path, &route.pattern) && method_matches(method, &route.methods))
            .cloned()
    }

    /// Drops every route.
    pub fn clear(&self) {
        self.routes.write().clear();
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Pattern grammar:
/// - `/p/*` matches `/p`, `/p/` and anything under `/p/`.
/// - `/p` matches `/p` and `/p/` (one trailing slash normalized away,
///   except the root).
/// - `/*` matches every path.
fn path_matches(request_path: &str, pattern: &str) -> bool {
    if let Some(base) = pattern.strip_suffix('*') {
        if let Some(trimmed) = base.strip_suffix('/') {
            return request_path == trimmed || request_path.starts_with(base);
        }
        return request_path.starts_with(base);
    }

    fn trim(s: &str) -> &str {
        if s == "/" {
            s
        } else {
            s.strip_suffix('/').unwrap_or(s)
        }
    }

    trim(request_path) == trim(pattern)
}

fn method_matches(method: &Method, allowed: &[Method]) -> bool {
    allowed.is_empty()
        || allowed
            .iter()
            .any(|m| m.as_str().eq_ignore_ascii_case(method.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_path_match() {
        let router = Router::new();
        router.add_route("/api/users", "user-service", vec![Method::GET, Method::POST]);

        let route = router.match_route(&Method::GET, "/api/users").unwrap();
        assert_eq!(route.service, "user-service");
    }

    #[test]
    fn test_wildcard_path_match() {
        let router = Router::new();
        router.add_route("/api/*", "api-service", vec![]);

        let route = router.match_route(&Method::GET, "/api/users/123").unwrap();
        assert_eq!(route.service, "api-service");
    }

    #[test]
    fn test_method_mismatch() {
        let router = Router::new();
        router.add_route("/api/users", "user-service", vec![Method::POST]);

        assert!(router.match_route(&Method::GET, "/api/users").is_none());
    }

    #[test]
    fn test_no_match() {
        let router = Router::new();
        router.add_route("/api/users", "user-service", vec![]);

        assert!(router.match_route(&Method::GET, "/api/products").is_none());
    }

    #[test]
    fn test_trailing_slash_normalization() {
        let router = Router::new();
        router.add_route("/api/users/", "user-service", vec![]);

        assert!(router.match_route(&Method::GET, "/api/users").is_some());
    }

    #[test]
    fn test_first_registered_wins() {
        let router = Router::new();
        router.add_route("/api/*", "first-service", vec![]);
        router.add_route("/api/users", "second-service", vec![]);

        let route = router.match_route(&Method::GET, "/api/users").unwrap();
        assert_eq!(route.service, "first-service");
    }

    #[test]
    fn test_empty_methods_allow_all() {
        let router = Router::new();
        router.add_route("/api/test", "test-service", vec![]);

        assert!(router.match_route(&Method::DELETE, "/api/test").is_some());
    }

    #[test]
    fn test_case_insensitive_method_matching() {
        let router = Router::new();
        router.add_route(
            "/api/test",
            "test-service",
            vec![
                Method::from_bytes(b"get").unwrap(),
                Method::from_bytes(b"post").unwrap(),
            ],
        );

        assert!(router.match_route(&Method::GET, "/api/test").is_some());
        assert!(router.match_route(&Method::DELETE, "/api/test").is_none());
    }

    #[test]
    fn test_root_wildcard_catches_everything() {
        let router = Router::new();
        router.add_route("/*", "catch-all", vec![]);

        assert!(router.match_route(&Method::GET, "/anything/goes/here").is_some());
        assert!(router.match_route(&Method::GET, "/").is_some());
    }

    #[test]
    fn test_exact_root_path() {
        let router = Router::new();
        router.add_route("/", "root-service", vec![]);

        assert!(router.match_route(&Method::GET, "/").is_some());
    }

    #[test]
    fn test_path_matching_table() {
        let cases = [
            ("/api/*", "/api/users", true),
            ("/api/*", "/api/users/123", true),
            ("/api/*", "/api/", true),
            ("/api/*", "/api", true),
            ("/api/*", "/api2/users", false),
            ("/exact", "/exact", true),
            ("/exact", "/exact/", true),
            ("/exact/", "/exact", true),
            ("/exact/", "/exact/", true),
            ("/*", "/anything", true),
            ("/*", "/", true),
        ];

        for (pattern, path, expected) in cases {
            assert_eq!(
                path_matches(path, pattern),
                expected,
                "pattern {pattern} vs path {path}"
            );
        }
    }

    #[test]
    fn test_clear() {
        let router = Router::new();
        router.add_route("/api/*", "api-service", vec![]);
        router.add_route("/orders", "order-service", vec![]);

        assert!(router.match_route(&Method::GET, "/api/test").is_some());
        router.clear();
        assert!(router.match_route(&Method::GET, "/api/test").is_none());
        assert!(router.is_empty());
    }

    #[test]
    fn test_concurrent_add_and_match() {
        use std::sync::Arc;

        let router = Arc::new(Router::new());
        let writer = {
            let router = Arc::clone(&router);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    router.add_route("/test", "service", vec![]);
                }
            })
        };
        let reader = {
            let router = Arc::clone(&router);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = router.match_route(&Method::GET, "/test");
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(router.len(), 100);
    }
}
