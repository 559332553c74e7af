use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → compile guards → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration. A missing guard key stops startup here.
    let config = GatewayConfig::load(&args.config_path)?;
    let gc_interval = Duration::from_secs(config.limiter.gc_interval_secs);

    // Phase 2: recorder first, so nothing recorded while compiling is lost.
    let metrics = Metrics::install()?;
    let state = server::GatewayState::new(config, metrics)?;

    // Phase 3: background loops.
    let shutdown = Arc::new(Notify::new());
    state.guards.start_gc(gc_interval);
    start_admin_server(&state, &args);

    tracing::info!(
        "server: starting gateway, listen={}, gateway_policy={}",
        args.listen,
        state.guards.gateway.policy().name()
    );

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 4: block until signal or until the proxy dies on its own.
    tokio::select! {
        _ = wait_for_shutdown(&shutdown) => {}
        _ = proxy_exited(&proxy_handle) => {}
    }

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("server: proxy failed, error={}", e);
            return Err(e);
        }
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

/// Resolves once the proxy task has finished (bind failure, for instance).
async fn proxy_exited(handle: &tokio::task::JoinHandle<Result<()>>) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: failed to install SIGTERM handler, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // One accept loop listens; the stored permit survives an iteration where
    // it is not parked in `notified()`.
    shutdown.notify_one();
}
