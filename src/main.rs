use routegate::access_log::AccessLog;
use routegate::acme::AcmeWorker;
use routegate::api::AdminApi;
use routegate::auth::{hash_password, AuthManager};
use routegate::config::Config;
use routegate::db::{Database, TrafficStatRecord};
use routegate::pool::{PoolConfig, UpstreamPool};
use routegate::proxy::{ProxyContext, ProxyServer};
use routegate::snapshot::Publisher;
use routegate::stats::StatsCollector;
use routegate::streams::StreamForwarder;
use routegate::tls::CertCatalog;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate=info".parse().expect("valid log directive")),
        )
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let config = Config::from_env();
    info!(
        http = %config.http_addr,
        https = %config.https_addr,
        api = %config.api_addr,
        "Starting routegate"
    );

    // Fatal initialization: store and certificate fallback
    let db = match Database::open(&config.db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(path = %config.db_path.display(), error = %e, "Cannot open store");
            std::process::exit(1);
        }
    };

    if let Err(e) = db.ensure_default_admin(&hash_password("changeme")) {
        error!(error = %e, "Cannot seed admin user");
        std::process::exit(1);
    }

    let catalog = match CertCatalog::new() {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            error!(error = %e, "Cannot generate fallback certificate");
            std::process::exit(1);
        }
    };

    let stats = Arc::new(StatsCollector::new());
    let access_log = AccessLog::open(&config.access_log_path);

    // Publisher and the initial snapshot
    let publisher = Arc::new(Publisher::new(Arc::clone(&db), Arc::clone(&catalog)));
    match publisher.reconcile().await {
        Ok(snapshot) => info!(
            hosts = snapshot.hosts.len(),
            streams = snapshot.streams.len(),
            "Initial configuration loaded"
        ),
        Err(e) => warn!(error = %e, "Initial snapshot build failed; starting empty"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ACME worker
    let (acme_worker, acme_handle) = AcmeWorker::new(
        Arc::clone(&db),
        Arc::clone(&catalog),
        Arc::clone(&publisher),
        config.certs_dir.clone(),
    );
    {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            acme_worker.run(shutdown).await;
        });
    }

    // Stream forwarder follows snapshot publications
    {
        let forwarder = StreamForwarder::new(Arc::clone(&stats));
        let publish_rx = publisher.subscribe();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            forwarder.run(publish_rx, shutdown).await;
        });
    }

    // Per-minute traffic flush into the store
    {
        let flush_db = Arc::clone(&db);
        let flush_stats = Arc::clone(&stats);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let (requests, bytes, s2xx, s4xx, s5xx) = flush_stats.drain_pending();
                        if requests == 0 {
                            continue;
                        }
                        let record = TrafficStatRecord {
                            ts: routegate::db::now_unix() / 60 * 60,
                            requests,
                            bytes,
                            status_2xx: s2xx,
                            status_4xx: s4xx,
                            status_5xx: s5xx,
                        };
                        if let Err(e) = flush_db.insert_traffic_stat(&record) {
                            error!(error = %e, "Traffic stat flush failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // Listeners: bind failures are fatal
    let http_listener = bind_or_exit(config.http_addr).await;
    let https_listener = bind_or_exit(config.https_addr).await;
    let api_listener = bind_or_exit(config.api_addr).await;

    let pool = Arc::new(UpstreamPool::new(PoolConfig {
        timeouts: config.timeouts,
        ..PoolConfig::default()
    }));

    let ctx = Arc::new(ProxyContext {
        snapshot: publisher.shared(),
        pool,
        stats: Arc::clone(&stats),
        access_log: Arc::clone(&access_log),
        challenges: acme_handle.challenges(),
        trusted_proxies: config.trusted_proxies.clone(),
    });

    // Plain HTTP data plane
    let http_proxy = ProxyServer::new(config.http_addr, Arc::clone(&ctx), shutdown_rx.clone());
    let mut http_handle = tokio::spawn(async move {
        if let Err(e) = http_proxy.run(http_listener).await {
            error!(error = %e, "HTTP proxy server error");
        }
    });

    // TLS data plane with SNI-driven certificate selection
    let tls_acceptor = TlsAcceptor::from(Arc::new(catalog.server_config()));
    let https_proxy = ProxyServer::new(config.https_addr, Arc::clone(&ctx), shutdown_rx.clone())
        .with_tls(tls_acceptor);
    let mut https_handle = tokio::spawn(async move {
        if let Err(e) = https_proxy.run(https_listener).await {
            error!(error = %e, "HTTPS proxy server error");
        }
    });

    // Control plane
    let admin = AdminApi::new(
        config.api_addr,
        Arc::clone(&db),
        Arc::clone(&publisher),
        Arc::clone(&stats),
        Arc::clone(&access_log),
        acme_handle,
        AuthManager::new(&config.jwt_secret),
        config.static_dir.clone(),
        shutdown_rx.clone(),
    );
    let mut admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run(api_listener).await {
            error!(error = %e, "Admin API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or a listener dying
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = &mut http_handle => runtime_failure("HTTP proxy"),
            _ = &mut https_handle => runtime_failure("HTTPS proxy"),
            _ = &mut admin_handle => runtime_failure("admin API"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
            _ = &mut http_handle => runtime_failure("HTTP proxy"),
            _ = &mut https_handle => runtime_failure("HTTPS proxy"),
            _ = &mut admin_handle => runtime_failure("admin API"),
        }
    }

    // Stop accepting, drain in-flight work, then exit
    info!(grace_secs = config.shutdown_grace.as_secs(), "Shutting down");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = http_handle.await;
        let _ = https_handle.await;
        let _ = admin_handle.await;
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!("Drain grace expired; aborting remaining tasks");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn bind_or_exit(addr: SocketAddr) -> TcpListener {
    match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Cannot bind listener");
            std::process::exit(1);
        }
    }
}

/// A listener task ending on its own is an unrecoverable runtime error
fn runtime_failure(which: &str) -> ! {
    error!(listener = which, "Listener task terminated unexpectedly");
    std::process::exit(2);
}
