use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use courtbook::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use courtbook::tenant::TenantManager;
use courtbook::wire;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Server settings, all from `COURTBOOK_*` environment variables.
struct Settings {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    payment_window_secs: i64,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    metrics_port: Option<u16>,
}

impl Settings {
    fn from_env() -> Self {
        Self {
            bind: env_or("COURTBOOK_BIND", "0.0.0.0".to_string()),
            port: env_or("COURTBOOK_PORT", 5433),
            data_dir: env_or("COURTBOOK_DATA_DIR", PathBuf::from("./data")),
            password: env_or("COURTBOOK_PASSWORD", "courtbook".to_string()),
            max_connections: env_or("COURTBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("COURTBOOK_COMPACT_THRESHOLD", 1000),
            payment_window_secs: env_or("COURTBOOK_PAYMENT_WINDOW_SECS", 900),
            tls_cert: std::env::var("COURTBOOK_TLS_CERT").ok(),
            tls_key: std::env::var("COURTBOOK_TLS_KEY").ok(),
            metrics_port: std::env::var("COURTBOOK_METRICS_PORT").ok().and_then(|s| s.parse().ok()),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    courtbook::observability::init(settings.metrics_port)?;

    let tls_acceptor =
        courtbook::tls::load_tls_acceptor(settings.tls_cert.as_deref(), settings.tls_key.as_deref())?;

    std::fs::create_dir_all(&settings.data_dir)?;

    let tenant_manager = Arc::new(TenantManager::with_payment_window(
        settings.data_dir.clone(),
        settings.compact_threshold,
        settings.payment_window_secs.saturating_mul(1000),
    ));
    let max_connections = settings.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("courtbook listening on {addr}");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  payment_window: {}s", settings.payment_window_secs);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let password = settings.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, tm, password, tls).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Give in-flight connections up to 10s to finish.
    info!("draining connections...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while semaphore.available_permits() < max_connections {
        if tokio::time::Instant::now() >= deadline {
            let remaining = max_connections - semaphore.available_permits();
            warn!("drain timeout, {remaining} connections still open");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("courtbook stopped");
    Ok(())
}
