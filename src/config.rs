//! Configuration loading, validation and hot-reload.
//!
//! Configuration is read once at startup from a TOML file (missing file
//! means defaults) and held immutable behind an `Arc`. When hot reload
//! is enabled, a background task polls the file's mtime and swaps the
//! config through [`ConfigManager`], notifying subscribed listeners.

use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: Option<TlsFiles>,
    pub health_check: HealthCheckConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Data/control plane port.
    pub port: u16,
    /// Prometheus metrics port.
    pub metrics_port: u16,
    /// Gossip bind port.
    pub gossip_port: u16,
    /// Reload configuration when the file changes on disk.
    pub hot_reload: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            metrics_port: 9090,
            gossip_port: 7946,
            hot_reload: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 5_000,
            path: "/health".to_string(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub read_ms: u64,
    pub write_ms: u64,
    pub idle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: 30_000,
            write_ms: 30_000,
            idle_ms: 120_000,
        }
    }
}

impl TimeoutConfig {
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// `host:port` of a peer proxy's gossip endpoint to join.
    pub join_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert_file: String,
    pub key_file: String,
}

impl Config {
    /// Loads configuration from a TOML file. A missing file yields the
    /// defaults; a malformed or invalid file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => return Err(ProxyError::Io(e)),
        };

        let config: Self = toml::from_str(&contents)
            .map_err(|e| ProxyError::InvalidConfig(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot start a working proxy.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ProxyError::InvalidConfig(msg));

        for (name, port) in [
            ("server", self.server.port),
            ("metrics", self.server.metrics_port),
            ("gossip", self.server.gossip_port),
        ] {
            if port == 0 {
                return invalid(format!("{name} port must be between 1 and 65535"));
            }
        }

        if self.server.port == self.server.metrics_port {
            return invalid(format!(
                "server port and metrics port cannot be the same: {}",
                self.server.port
            ));
        }
        if self.server.port == self.server.gossip_port {
            return invalid(format!(
                "server port and gossip port cannot be the same: {}",
                self.server.port
            ));
        }
        if self.server.metrics_port == self.server.gossip_port {
            return invalid(format!(
                "metrics port and gossip port cannot be the same: {}",
                self.server.metrics_port
            ));
        }

        if self.health_check.interval_ms < 1_000 {
            return invalid(format!(
                "health check interval must be at least 1s, got {}ms",
                self.health_check.interval_ms
            ));
        }
        if self.health_check.timeout_ms < 1_000 {
            return invalid(format!(
                "health check timeout must be at least 1s, got {}ms",
                self.health_check.timeout_ms
            ));
        }
        if self.health_check.timeout_ms >= self.health_check.interval_ms {
            return invalid(format!(
                "health check timeout ({}ms) must be less than interval ({}ms)",
                self.health_check.timeout_ms, self.health_check.interval_ms
            ));
        }

        for (name, ms) in [
            ("read", self.timeouts.read_ms),
            ("write", self.timeouts.write_ms),
            ("idle", self.timeouts.idle_ms),
        ] {
            if ms < 1_000 {
                return invalid(format!("{name} timeout must be at least 1s, got {ms}ms"));
            }
        }

        if !["debug", "info", "warn", "error"].contains(&self.logging.level.to_lowercase().as_str())
        {
            return invalid(format!(
                "invalid log level '{}', must be one of: debug, info, warn, error",
                self.logging.level
            ));
        }
        if !["text", "json"].contains(&self.logging.format.to_lowercase().as_str()) {
            return invalid(format!(
                "invalid log format '{}', must be one of: text, json",
                self.logging.format
            ));
        }

        if let Some(tls) = &self.tls {
            if tls.cert_file.is_empty() {
                return invalid("tls cert_file is required when TLS is enabled".to_string());
            }
            if tls.key_file.is_empty() {
                return invalid("tls key_file is required when TLS is enabled".to_string());
            }
        }

        Ok(())
    }
}

type ConfigListener = Arc<dyn Fn(Arc<Config>) + Send + Sync>;

/// Holds the current configuration and fans reloads out to listeners.
pub struct ConfigManager {
    config: RwLock<Arc<Config>>,
    listeners: RwLock<Vec<ConfigListener>>,
}

impl ConfigManager {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Current configuration snapshot.
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    /// Registers a listener invoked (in its own task) after each
    /// successful reload.
    pub fn subscribe(&self, listener: impl Fn(Arc<Config>) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Reloads from disk and notifies listeners. A failed reload keeps
    /// the previous configuration.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let config = Arc::new(Config::load(path)?);
        *self.config.write() = Arc::clone(&config);

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let config = Arc::clone(&config);
            tokio::spawn(async move {
                listener(config);
            });
        }
        Ok(())
    }
}

/// Polls the config file's mtime and reloads through the manager when
/// it changes. Reload failures are logged, never fatal.
pub async fn watch(
    manager: Arc<ConfigManager>,
    path: PathBuf,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let mut last_modified = modified_at(&path);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = modified_at(&path);
                if current.is_some() && current != last_modified {
                    last_modified = current;
                    info!(path = %path.display(), "configuration file changed, reloading");
                    match manager.load(&path) {
                        Ok(()) => Metrics::inc_config_reloads(),
                        Err(e) => warn!(error = %e, "failed to reload configuration"),
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.metrics_port, 9090);
        assert_eq!(config.server.gossip_port, 7946);
        assert_eq!(config.health_check.interval(), Duration::from_secs(10));
        assert_eq!(config.health_check.timeout(), Duration::from_secs(5));
        assert_eq!(config.health_check.path, "/health");
        assert_eq!(config.timeouts.read(), Duration::from_secs(30));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/fluxgate.toml").unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_parse_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 8181
gossip_port = 7900

[cluster]
join_address = "10.0.0.5:7946"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8181);
        assert_eq!(config.server.gossip_port, 7900);
        assert_eq!(config.server.metrics_port, 9090);
        assert_eq!(config.cluster.join_address.as_deref(), Some("10.0.0.5:7946"));
    }

    #[test]
    fn test_port_conflicts_rejected() {
        let mut config = Config::default();
        config.server.metrics_port = config.server.port;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.gossip_port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_health_timeout_must_be_less_than_interval() {
        let mut config = Config::default();
        config.health_check.timeout_ms = config.health_check.interval_ms;
        assert!(config.validate().is_err());

        config.health_check.timeout_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_logging_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_requires_both_files() {
        let mut config = Config::default();
        config.tls = Some(TlsFiles {
            cert_file: "cert.pem".to_string(),
            key_file: String::new(),
        });
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_manager_reload_notifies_listeners() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server]\nport = 8282\n").unwrap();

        let manager = ConfigManager::new(Config::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.subscribe(move |config| {
            tx.send(config.server.port).unwrap();
        });

        manager.load(file.path()).unwrap();
        assert_eq!(manager.get().server.port, 8282);
        assert_eq!(rx.recv().await.unwrap(), 8282);
    }
}
