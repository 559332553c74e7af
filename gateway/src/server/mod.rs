mod admin;
pub mod bootstrap;
mod state;

pub use admin::handle_admin;
pub use state::GatewayState;

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::{GracefulShutdown, Watcher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Grace period for in-flight requests once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept (EMFILE and friends) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accept connections for the guarded proxy until `shutdown` is notified.
///
/// On shutdown every live connection is told to finish: idle keep-alive
/// connections close at once, busy ones after their current response. The
/// call returns when all have closed or `DRAIN_TIMEOUT` passes.
pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);

    let graceful = GracefulShutdown::new();

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => break,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                metrics::counter!("gateway_connections_total", "status" => "accepted").increment(1);
                tokio::spawn(serve_proxy_connection(
                    stream,
                    peer_addr,
                    state.clone(),
                    graceful.watcher(),
                ));
            }
            Err(e) => {
                metrics::counter!("gateway_connections_total", "status" => "error").increment(1);
                error!("server: proxy: accept failed, error={}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    let active = graceful.count();
    info!(
        "server: proxy: stopped accepting, draining {} connections",
        active
    );
    match tokio::time::timeout(DRAIN_TIMEOUT, graceful.shutdown()).await {
        Ok(()) => info!("server: proxy: all connections drained"),
        Err(_) => warn!(
            "server: proxy: drain timeout ({}s), dropping remaining connections",
            DRAIN_TIMEOUT.as_secs()
        ),
    }

    Ok(())
}

async fn serve_proxy_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: GatewayState,
    watcher: Watcher,
) {
    metrics::gauge!("gateway_connections_active").increment(1.0);

    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { proxy::handle_request(req, state, peer_addr).await }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().keep_alive(true);
    builder
        .http2()
        .keep_alive_interval(Some(Duration::from_secs(20)));
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);

    if let Err(e) = watcher.watch(conn).await {
        if !is_closed_by_peer(&*e) {
            error!(
                "server: proxy: connection error, peer={}, error={}",
                peer_addr, e
            );
        }
    }

    metrics::gauge!("gateway_connections_active").decrement(1.0);
}

fn is_closed_by_peer(e: &(dyn std::error::Error + 'static)) -> bool {
    e.downcast_ref::<hyper::Error>()
        .is_some_and(|e| e.is_incomplete_message() || e.is_closed())
        || e.to_string().contains("connection closed")
}

/// Serve health/readiness checks, metrics and the compiled guard listings.
/// A failed accept is logged and retried; it never stops the listener.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!("server: admin: accept failed, error={}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let state = state.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            let conn = hyper::server::conn::http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), svc);
            if let Err(e) = conn.await {
                if !is_closed_by_peer(&e) {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
