//! TLS certificate loading and hot-swap.
//!
//! The manager holds the current acceptor behind a lock; config reloads
//! swap it wholesale (never mutate in place) and notify subscribers.
//! Failure to load at startup is fatal; failure on reload keeps the
//! previous acceptor.

use crate::config::TlsFiles;
use crate::error::{ProxyError, Result};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

type TlsListener = Arc<dyn Fn(Option<TlsAcceptor>) + Send + Sync>;

/// Owns the server-side TLS state for the proxy listener.
pub struct TlsManager {
    acceptor: RwLock<Option<TlsAcceptor>>,
    listeners: RwLock<Vec<TlsListener>>,
}

impl std::fmt::Debug for TlsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsManager").finish_non_exhaustive()
    }
}

impl TlsManager {
    /// Builds the manager from the optional TLS file config.
    pub fn new(files: Option<&TlsFiles>) -> Result<Self> {
        let acceptor = files.map(build_acceptor).transpose()?;
        if acceptor.is_some() {
            info!("TLS enabled");
        }
        Ok(Self {
            acceptor: RwLock::new(acceptor),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.acceptor.read().is_some()
    }

    /// The current acceptor, if TLS is configured.
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.acceptor.read().clone()
    }

    /// Registers a listener notified after each swap.
    pub fn subscribe(&self, listener: impl Fn(Option<TlsAcceptor>) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Swaps in a new TLS configuration. On error the previous acceptor
    /// stays in place.
    pub fn update(&self, files: Option<&TlsFiles>) -> Result<()> {
        let acceptor = files.map(build_acceptor).transpose()?;
        *self.acceptor.write() = acceptor.clone();
        info!(enabled = acceptor.is_some(), "TLS configuration swapped");

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(acceptor.clone());
        }
        Ok(())
    }
}

fn build_acceptor(files: &TlsFiles) -> Result<TlsAcceptor> {
    let certs = load_certs(Path::new(&files.cert_file))?;
    let key = load_private_key(Path::new(&files.key_file))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::TlsConfig {
            message: format!("failed to configure TLS: {}", e),
        })?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| ProxyError::TlsConfig {
        message: format!("failed to open cert file {}: {}", path.display(), e),
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|cert| cert.ok())
        .collect();

    if certs.is_empty() {
        return Err(ProxyError::TlsConfig {
            message: format!("no certificates found in {}", path.display()),
        });
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| ProxyError::TlsConfig {
        message: format!("failed to open key file {}: {}", path.display(), e),
    })?;
    let mut reader = BufReader::new(file);

    let keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::read_all(&mut reader)
        .filter_map(|item| match item.ok()? {
            rustls_pemfile::Item::Pkcs1Key(key) => Some(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => Some(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => Some(PrivateKeyDer::Sec1(key)),
            _ => None,
        })
        .collect();

    keys.into_iter()
        .next()
        .ok_or_else(|| ProxyError::TlsConfig {
            message: format!("no private key found in {}", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_files() {
        let manager = TlsManager::new(None).unwrap();
        assert!(!manager.is_enabled());
        assert!(manager.acceptor().is_none());
    }

    #[test]
    fn test_missing_cert_file_is_an_error() {
        let files = TlsFiles {
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
        };
        let err = TlsManager::new(Some(&files)).unwrap_err();
        assert!(matches!(err, ProxyError::TlsConfig { .. }));
    }

    #[test]
    fn test_failed_update_keeps_previous_state() {
        let manager = TlsManager::new(None).unwrap();
        let files = TlsFiles {
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
        };
        assert!(manager.update(Some(&files)).is_err());
        assert!(!manager.is_enabled());
    }
}
