//! Error types for the FluxGate proxy.

use std::io;
use thiserror::Error;

/// Errors that can occur during proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to bind the HTTP listener.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Failed to bind the gossip socket.
    #[error("failed to bind gossip socket to {addr}: {source}")]
    GossipBind { addr: String, source: io::Error },

    /// The cluster join address could not be resolved.
    #[error("cannot resolve join address {addr}: {source}")]
    ClusterJoin { addr: String, source: io::Error },

    /// The service name collides with a reserved name.
    #[error("service name '{0}' is reserved")]
    ReservedName(String),

    /// No instance with the given id is registered.
    #[error("service instance not found: {0}")]
    InstanceNotFound(String),

    /// Failed to connect to an upstream backend.
    #[error("failed to connect to upstream {addr}: {source}")]
    UpstreamConnect { addr: String, source: io::Error },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed HTTP message.
    #[error("invalid http message: {0}")]
    HttpBuild(#[from] http::Error),

    /// WebSocket relay failure.
    #[error("websocket proxy error: {0}")]
    WebSocket(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration error.
    #[error("TLS configuration error: {message}")]
    TlsConfig { message: String },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
