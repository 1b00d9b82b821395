mod errors;
mod handler;
mod internal;
mod room;
mod state;
mod tls;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use chorus_fabric::{Bus, Directory, Node, RpcHandler, SERVICE_SIGNAL};
use chorus_protocol::{SignalConfig, load_config};

use crate::state::SignalService;

const CONNECT_BACKOFF: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn parse_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/signal.toml");
    let mut i = 1;
    while i < args.len() {
        if matches!(args[i].as_str(), "--config" | "-c") && i + 1 < args.len() {
            config_path = PathBuf::from(&args[i + 1]);
            i += 1;
        }
        i += 1;
    }
    config_path
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = parse_args();
    let config: SignalConfig = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            std::process::exit(1);
        }
    }

    let dir = connect_directory(&config.etcd.endpoints).await;
    let bus = connect_bus(&config.nats.url).await;

    let node = Node::new(&config.node.dc, &config.node.id, SERVICE_SIGNAL);
    let service = SignalService::new(node, dir, bus.clone());
    service.start().await?;

    // Signal-to-signal RPC (peer_kick)
    let handler: RpcHandler = {
        let service = Arc::clone(&service);
        Arc::new(move |method, data| {
            let service = Arc::clone(&service);
            Box::pin(async move { internal::handle_rpc(&service, &method, data).await })
        })
    };
    let rpc_server = bus
        .serve(&service.node().rpc_subject(), handler)
        .await?;

    if let Some(addr) = config.node.debug_listen.clone() {
        spawn_debug_listener(addr);
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .context("Invalid bind address")?;
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws::ws_upgrade))
        .with_state(Arc::clone(&service));

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    tracing::info!(
        id = %config.node.id,
        dc = %config.node.dc,
        "signal service ready on {bind_addr}"
    );

    match (&config.http.cert, &config.http.key) {
        (Some(cert), Some(key)) => {
            let tls_config = tls::build_tls_config(cert, key)?;
            let acceptor = tls::make_acceptor(tls_config);
            serve_tls(listener, acceptor, app).await?;
        }
        _ => {
            tracing::info!("TLS disabled, serving plain WebSocket");
            serve_plain(listener, app).await?;
        }
    }

    tracing::info!("shutting down");
    rpc_server.close();
    service.close().await;
    Ok(())
}

async fn serve_plain(listener: TcpListener, app: axum::Router) -> Result<()> {
    let shutdown = async {
        let _ = wait_for_shutdown().await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}

/// TLS accept loop. Runs until SIGINT/SIGTERM; every accepted connection is
/// served on its own task.
async fn serve_tls(
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    app: axum::Router,
) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT");
                return Ok(());
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                return Ok(());
            }
        };
        match accepted {
            Ok((tcp, remote)) => {
                tokio::spawn(serve_tls_conn(tcp, remote, acceptor.clone(), app.clone()));
            }
            Err(e) => tracing::warn!("accept failed: {e}"),
        }
    }
}

/// One TLS connection: handshake under a deadline, then let hyper drive the
/// router with upgrade support so `/ws` can switch protocols.
async fn serve_tls_conn(
    tcp: tokio::net::TcpStream,
    remote: SocketAddr,
    acceptor: tokio_rustls::TlsAcceptor,
    app: axum::Router,
) {
    let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(%remote, "TLS handshake failed: {e}");
            return;
        }
        Err(_) => {
            tracing::debug!(%remote, "TLS handshake deadline exceeded");
            return;
        }
    };
    let served = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .serve_connection_with_upgrades(
            hyper_util::rt::TokioIo::new(stream),
            hyper_util::service::TowerToHyperService::new(app),
        )
        .await;
    if let Err(e) = served {
        tracing::debug!(%remote, "connection ended: {e}");
    }
}

async fn connect_directory(endpoints: &[String]) -> Directory {
    loop {
        match Directory::connect(endpoints).await {
            Ok(dir) => return dir,
            Err(e) => {
                tracing::warn!("etcd connect failed, retrying: {e}");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}

async fn connect_bus(url: &str) -> Bus {
    loop {
        match Bus::connect(url).await {
            Ok(bus) => return bus,
            Err(e) => {
                tracing::warn!("NATS connect failed, retrying: {e}");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}

fn spawn_debug_listener(addr: String) {
    tokio::spawn(async move {
        let app = axum::Router::new().route("/healthz", axum::routing::get(|| async { "ok" }));
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "debug listener ready");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::warn!("debug listener failed: {e}");
                }
            }
            Err(e) => tracing::warn!(%addr, "debug listener bind failed: {e}"),
        }
    });
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
    Ok(())
}
