mod capture;
mod rtc;
mod service;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use chorus_fabric::{Bus, Directory, Node, RpcHandler, SERVICE_SFU, ServiceNode};
use chorus_protocol::{SfuConfig, load_config};

use crate::rtc::{RouterTable, RtcEngine};
use crate::service::{SfuService, start_clean_notifier, start_payload_reporter};

const CONNECT_BACKOFF: Duration = Duration::from_secs(5);

fn parse_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/sfu.toml");
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
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = parse_args();
    let config: SfuConfig = load_config(&config_path)
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

    let node = Node::new(&config.node.dc, &config.node.id, SERVICE_SFU);
    let service_node = Arc::new(ServiceNode::new(dir.clone(), node));
    service_node.register().await?;

    let engine = RtcEngine::new(&config.webrtc);
    let (table, clean_rx) = RouterTable::new(engine, config.capture.clone());
    table.start_sweeper();

    let caster = bus.broadcaster(&service_node.event_topic());
    start_clean_notifier(clean_rx, caster);
    start_payload_reporter(Arc::clone(&table), Arc::clone(&service_node));

    let sfu = Arc::new(SfuService::new(Arc::clone(&table)));
    let handler: RpcHandler = {
        let sfu = Arc::clone(&sfu);
        Arc::new(move |method, data| {
            let sfu = Arc::clone(&sfu);
            Box::pin(async move { sfu.handle(&method, data).await })
        })
    };
    let rpc_server = bus.serve(&service_node.rpc_subject(), handler).await?;

    if let Some(addr) = config.node.debug_listen.clone() {
        spawn_debug_listener(addr);
    }

    tracing::info!(
        id = %config.node.id,
        dc = %config.node.dc,
        "sfu service ready"
    );

    wait_for_shutdown().await?;

    tracing::info!("shutting down");
    rpc_server.close();
    table.close_all().await;
    service_node.close().await;
    Ok(())
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
