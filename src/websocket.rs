//! WebSocket pass-through proxying.
//!
//! Upgrade requests are not parsed as WebSocket frames: the original
//! request head is written verbatim to a raw TCP connection to the
//! backend, the backend's handshake response is relayed to the client,
//! and after the 101 both directions are copied byte-for-byte until
//! either side closes.

use crate::error::{ProxyError, Result};
use crate::proxy::ConnectionGuard;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// True when the request asks for a WebSocket upgrade
/// (`Upgrade: websocket` plus `Connection: … upgrade …`,
/// case-insensitive).
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    upgrade && connection
}

/// Relays a WebSocket session between the client and the backend.
///
/// Returns the backend's handshake response. On a 101 the relay runs in
/// a spawned task that holds the connection guard until either copy
/// direction completes; a non-101 handshake response is returned to the
/// client as-is.
pub async fn proxy_websocket(
    mut req: Request<Incoming>,
    backend_url: &http::Uri,
    guard: ConnectionGuard,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let authority = backend_url
        .authority()
        .ok_or_else(|| ProxyError::WebSocket(format!("backend url has no authority: {backend_url}")))?;
    let host = authority.host();
    let port = authority.port_u16().unwrap_or(80);
    let target = format!("{host}:{port}");

    let mut backend = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(ProxyError::UpstreamConnect {
                addr: target,
                source: e,
            })
        }
        Err(_) => {
            return Err(ProxyError::UpstreamConnect {
                addr: target,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };

    backend.write_all(&request_head(&req)).await?;

    let (head_bytes, leftover) = read_response_head(&mut backend).await?;
    let (status, headers) = parse_response_head(&head_bytes)?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %status, "backend refused websocket upgrade");
        let body = Full::new(Bytes::from(leftover))
            .map_err(|never| match never {})
            .boxed();
        return Ok(builder.body(body)?);
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let _guard = guard;
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() {
                    if let Err(e) = client.write_all(&leftover).await {
                        warn!(error = %e, "failed to flush early websocket bytes");
                        return;
                    }
                }
                match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                    Ok((to_backend, to_client)) => {
                        debug!(to_backend, to_client, "websocket session closed");
                    }
                    Err(e) => debug!(error = %e, "websocket relay ended with error"),
                }
            }
            Err(e) => warn!(error = %e, "client upgrade failed"),
        }
    });

    let body = Full::new(Bytes::new()).map_err(|never| match never {}).boxed();
    Ok(builder.body(body)?)
}

/// Serializes the request line and headers exactly as received.
fn request_head(req: &Request<Incoming>) -> Vec<u8> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(path_and_query.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Reads until the end of the backend's response head; returns the head
/// bytes and anything read past it (early frames).
async fn read_response_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::WebSocket(
                "backend closed before handshake response".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(ProxyError::WebSocket(
                "oversized handshake response from backend".to_string(),
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_response_head(head: &[u8]) -> Result<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::WebSocket("non-utf8 handshake response".to_string()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| ProxyError::WebSocket("empty handshake response".to_string()))?;
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::WebSocket(format!("bad status line: {status_line}")))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| ProxyError::WebSocket(format!("bad status code: {code}")))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, UPGRADE};
    use http::HeaderValue;

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn test_parse_handshake_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: abc123\r\n\r\n";
        let (status, headers) = parse_response_head(head).unwrap();

        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(n, v)| n == "Sec-WebSocket-Accept" && v == "abc123"));
    }

    #[test]
    fn test_parse_rejection_response() {
        let head = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
        let (status, _) = parse_response_head(head).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_malformed_status_line() {
        assert!(parse_response_head(b"garbage\r\n\r\n").is_err());
    }

    #[test]
    fn test_head_end_detection() {
        assert_eq!(find_head_end(b"HTTP/1.1 101 x\r\n\r\n"), Some(18));
        assert_eq!(find_head_end(b"HTTP/1.1 101 x\r\n"), None);

        let with_leftover = b"HTTP/1.1 101 x\r\n\r\nframe-bytes";
        let end = find_head_end(with_leftover).unwrap();
        assert_eq!(&with_leftover[end..], b"frame-bytes");
    }
}
