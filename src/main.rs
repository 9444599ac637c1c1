use fluxgate::admin_listener::AdminListener;
use fluxgate::config::{self, Config, ConfigManager, LoggingConfig};
use fluxgate::error::Result;
use fluxgate::gossip::{Gossip, GossipConfig};
use fluxgate::health::HealthChecker;
use fluxgate::proxy::ProxyServer;
use fluxgate::registry::Registry;
use fluxgate::tls::TlsManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Command-line overrides layered on top of the config file.
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    port: Option<u16>,
    gossip_port: Option<u16>,
    metrics_port: Option<u16>,
    join: Option<String>,
}

fn parse_args() -> std::result::Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(flag) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .ok_or_else(|| format!("missing value for {name}"))
        };
        match flag.as_str() {
            "-config" => args.config = Some(PathBuf::from(value("-config")?)),
            "-port" => {
                args.port = Some(value("-port")?.parse().map_err(|_| "invalid -port value")?)
            }
            "-gossip-port" => {
                args.gossip_port = Some(
                    value("-gossip-port")?
                        .parse()
                        .map_err(|_| "invalid -gossip-port value")?,
                )
            }
            "-metrics-port" => {
                args.metrics_port = Some(
                    value("-metrics-port")?
                        .parse()
                        .map_err(|_| "invalid -metrics-port value")?,
                )
            }
            "-join" => args.join = Some(value("-join")?),
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(args)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("fluxgate: {e}");
            eprintln!(
                "usage: fluxgate [-config <path>] [-port <port>] [-gossip-port <port>] \
                 [-metrics-port <port>] [-join <addr:port>]"
            );
            std::process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        // Logging may not be initialized yet when config loading fails.
        eprintln!("fluxgate: fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("fluxgate.toml"));

    let mut config = Config::load(&config_path)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(port) = args.gossip_port {
        config.server.gossip_port = port;
    }
    if let Some(port) = args.metrics_port {
        config.server.metrics_port = port;
    }
    if let Some(join) = args.join.clone() {
        config.cluster.join_address = Some(join);
    }
    config.validate()?;

    init_logging(&config.logging);
    info!("Starting FluxGate");
    info!(
        port = config.server.port,
        metrics_port = config.server.metrics_port,
        gossip_port = config.server.gossip_port,
        join = config.cluster.join_address.as_deref().unwrap_or("-"),
        "configuration loaded"
    );

    let manager = Arc::new(ConfigManager::new(config.clone()));
    let config = Arc::new(config);

    let registry = Arc::new(Registry::new());

    let gossip = Gossip::bind(
        GossipConfig {
            port: config.server.gossip_port,
            join: config.cluster.join_address.clone(),
            ..Default::default()
        },
        Arc::clone(&registry),
    )
    .await?;

    let health = Arc::new(HealthChecker::new(
        config.health_check.interval(),
        config.health_check.timeout(),
        config.health_check.path.clone(),
    ));

    let tls = Arc::new(TlsManager::new(config.tls.as_ref())?);
    {
        let tls = Arc::clone(&tls);
        manager.subscribe(move |reloaded| {
            if let Err(e) = tls.update(reloaded.tls.as_ref()) {
                warn!(error = %e, "failed to apply reloaded TLS configuration");
            }
        });
    }

    let proxy = ProxyServer::bind(
        &format!("0.0.0.0:{}", config.server.port),
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&health),
        Arc::clone(&tls),
    )
    .await?;
    let proxy_addr = proxy.local_addr();
    info!(addr = %proxy_addr, "proxy listening");

    let admin = AdminListener::bind(
        &format!("0.0.0.0:{}", config.server.metrics_port),
        Arc::clone(&registry),
    )
    .await?;
    info!(addr = %admin.local_addr(), "metrics endpoints on /health and /metrics");

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let gossip_task = tokio::spawn({
        let gossip = Arc::clone(&gossip);
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = gossip.run(shutdown_rx).await {
                error!("gossip error: {}", e);
            }
        }
    });

    tokio::spawn(Arc::clone(&health).run(shutdown_tx.subscribe()));

    if config.server.hot_reload {
        tokio::spawn(config::watch(
            Arc::clone(&manager),
            config_path,
            shutdown_tx.subscribe(),
        ));
    }

    let mut proxy_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = proxy.serve(shutdown_rx).await {
                error!("proxy listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut proxy_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut proxy_task => {
            proxy_finished = true;
            if let Err(err) = res {
                error!("proxy task join error: {}", err);
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            if let Err(err) = res {
                error!("admin task join error: {}", err);
            }
        }
    }

    let _ = shutdown_tx.send(());

    // Drain deadline covers the listeners and the gossip goodbye.
    let drain = async {
        if !proxy_finished {
            let _ = proxy_task.await;
        }
        if !admin_finished {
            let _ = admin_task.await;
        }
        let _ = gossip_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("graceful drain deadline exceeded");
    }

    info!("shutdown complete");
    Ok(())
}
