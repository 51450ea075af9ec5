//! Process bootstrap: Raft node, proxy and both client listeners.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use trellis_raft::node::{RaftNode, RaftNodeConfig};
use trellis_raft::{ProxyOptions, ServerProxy};
use trellis_resources::builtin_registry;

use crate::args_parse::Membership;
use crate::http::{build_router, AppState};
use crate::service_configuration::ServiceConfiguration;
use crate::socket::socket_router;

/// Run a Trellis server until ctrl-c.
pub async fn run(config: ServiceConfiguration) -> Result<()> {
    let registry = Arc::new(builtin_registry().context("Failed to build the resource registry")?);
    info!(
        cluster = %config.cluster_name,
        types = registry.types().count(),
        "starting Trellis server"
    );

    let node = RaftNode::start(RaftNodeConfig {
        cluster_name: config.cluster_name.clone(),
        raft_addr: config.raft_addr,
        advertised_addr: Some(config.advertised_addr.clone()),
        data_dir: config.data_dir.clone(),
        storage: config.storage,
        heartbeat_interval: config.heartbeat_interval,
        election_timeout_min: config.election_timeout_min,
        election_timeout_max: config.election_timeout_max,
        snapshot_logs_since_last: config.snapshot_logs_since_last,
        tick_interval: config.tick_interval,
        registry,
    })
    .await
    .context("Failed to start the Raft node")?;

    match &config.membership {
        Membership::Bootstrap(peers) => node.bootstrap(peers).await?,
        Membership::Join(members) => node.join(members).await?,
    }

    let proxy = ServerProxy::new(
        node.consensus(),
        ProxyOptions {
            request_timeout: config.request_timeout,
            default_session_timeout_ms: config.default_session_timeout_ms,
        },
    );

    let http = build_router(Arc::new(AppState {
        proxy: proxy.clone(),
        event_poll_timeout: config.event_poll_timeout,
    }));
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("Failed to bind the HTTP listener on {}", config.http_addr))?;
    let client_listener = TcpListener::bind(config.client_addr)
        .await
        .with_context(|| format!("Failed to bind the client listener on {}", config.client_addr))?;

    info!(addr = %config.http_addr, "HTTP/JSON front-end listening");
    info!(addr = %config.client_addr, "WebSocket front-end listening");

    let http_server = axum::serve(http_listener, http).with_graceful_shutdown(shutdown_signal());
    let socket_server =
        axum::serve(client_listener, socket_router(proxy)).with_graceful_shutdown(shutdown_signal());

    let (http_result, socket_result) = tokio::join!(
        async { http_server.await },
        async { socket_server.await }
    );
    if let Err(e) = &http_result {
        warn!(error = %e, "HTTP front-end exited with error");
    }
    if let Err(e) = &socket_result {
        warn!(error = %e, "WebSocket front-end exited with error");
    }

    node.shutdown().await?;
    info!("Trellis server stopped");
    http_result.context("HTTP front-end failed")?;
    socket_result.context("WebSocket front-end failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
