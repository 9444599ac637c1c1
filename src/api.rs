//! Control-plane HTTP API: register, deregister, list, health.
//!
//! All success responses are JSON; validation failures are plain-text
//! 400s. Wrong methods on known paths answer 405.

use crate::error::ProxyError;
use crate::proxy::{error_response, ProxyServer};
use crate::registry::{is_reserved_service_name, ServiceInstance};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

type ApiResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Dispatches a request under `/api/v1/` to its handler.
pub(crate) async fn handle_control<B>(server: &ProxyServer, req: Request<B>) -> ApiResponse
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let method_not_allowed =
        || error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");

    match path.as_str() {
        "/api/v1/health" if method == Method::GET => handle_health(server),
        "/api/v1/services" if method == Method::GET => {
            handle_service_list(server, req.uri().query())
        }
        "/api/v1/services/register" if method == Method::POST => {
            handle_register(server, req).await
        }
        "/api/v1/services/deregister" if method == Method::DELETE => {
            handle_deregister(server, req.uri().query())
        }
        "/api/v1/health" | "/api/v1/services" | "/api/v1/services/register"
        | "/api/v1/services/deregister" => method_not_allowed(),
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

fn handle_health(server: &ProxyServer) -> ApiResponse {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "timestamp": unix_timestamp(),
            "services": server.pool_count(),
        }),
    )
}

fn handle_service_list(server: &ProxyServer, query: Option<&str>) -> ApiResponse {
    if let Some(service) = query_param(query, "service") {
        let instances = server.registry().get_instances(&service);
        return json_response(
            StatusCode::OK,
            &json!({
                "service": service,
                "instances": instances,
                "route": format!("/{service}/*"),
                "timestamp": unix_timestamp(),
            }),
        );
    }

    let all = server.registry().get_all_services();
    let services: serde_json::Map<String, serde_json::Value> = all
        .iter()
        .map(|(name, instances)| {
            (
                name.clone(),
                json!({
                    "instances": instances,
                    "route": format!("/{name}/*"),
                }),
            )
        })
        .collect();

    json_response(
        StatusCode::OK,
        &json!({
            "services": services,
            "total": all.len(),
            "timestamp": unix_timestamp(),
        }),
    )
}

async fn handle_register<B>(server: &ProxyServer, req: Request<B>) -> ApiResponse
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read registration body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    let instance: ServiceInstance = match serde_json::from_slice(&body) {
        Ok(instance) => instance,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };

    if instance.id.is_empty()
        || instance.service.is_empty()
        || instance.address.is_empty()
        || instance.port == 0
    {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing required fields: id, service, address, port",
        );
    }

    if is_reserved_service_name(&instance.service) {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Service name '{}' is reserved", instance.service),
        );
    }

    let (service, id) = (instance.service.clone(), instance.id.clone());
    match server.registry().register(instance) {
        Ok(()) => {
            info!(service = %service, id = %id, "service registered");
            json_response(
                StatusCode::CREATED,
                &json!({
                    "status": "registered",
                    "service": service,
                    "id": id,
                    "route": format!("/{service}/*"),
                    "timestamp": unix_timestamp(),
                }),
            )
        }
        Err(ProxyError::ReservedName(name)) => error_response(
            StatusCode::BAD_REQUEST,
            &format!("Service name '{name}' is reserved"),
        ),
        Err(e) => {
            warn!(error = %e, "failed to register service");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Registration failed")
        }
    }
}

fn handle_deregister(server: &ProxyServer, query: Option<&str>) -> ApiResponse {
    let Some(id) = query_param(query, "id") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing service ID parameter");
    };

    match server.registry().deregister(&id) {
        Ok(()) => {
            info!(id = %id, "service deregistered");
            json_response(
                StatusCode::OK,
                &json!({
                    "status": "deregistered",
                    "id": id,
                    "timestamp": unix_timestamp(),
                }),
            )
        }
        Err(e) => {
            // Unknown ids answer 500 here, kept intentionally for
            // clients that already rely on it.
            warn!(id = %id, error = %e, "failed to deregister service");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Deregistration failed")
        }
    }
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> ApiResponse {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding error"))
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key && !v.is_empty()).then(|| v.to_string())
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("id=abc&service=x"), "id"),
            Some("abc".to_string())
        );
        assert_eq!(
            query_param(Some("service=x&id=abc"), "id"),
            Some("abc".to_string())
        );
        assert_eq!(query_param(Some("service=x"), "id"), None);
        assert_eq!(query_param(Some("id="), "id"), None);
        assert_eq!(query_param(None, "id"), None);
    }

    #[test]
    fn test_json_response_content_type() {
        let response = json_response(StatusCode::OK, &json!({"status": "ok"}));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
