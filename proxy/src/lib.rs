pub mod admin_service;
pub mod balancer;
pub mod config;
pub mod metrics_defs;
pub mod release;
pub mod router;
pub mod servers;
pub mod service;
pub mod state;
pub mod sync;

use crate::service::{Gateway, GatewayService};
use crate::state::GatewayState;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use shared::resolve::SystemResolver;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("sync error: {0}")]
    Sync(#[from] sync::SyncError),
}

/// Runs one worker: the poller and DNS tasks feeding the registries, the
/// admin listener, and the gateway accept loop.
pub async fn run(config: config::Config) -> Result<(), ProxyError> {
    let state = Arc::new(GatewayState::new(config.enable_dynamic_servers));

    let client = sync::ConfigClient::new(&config.publisher_url)?;
    tokio::spawn(sync::run_sync_loop(
        state.clone(),
        client,
        Duration::from_secs(config.sync_interval_secs.max(1)),
        Duration::from_secs(config.force_sync_interval_secs.max(1)),
    ));
    tokio::spawn(sync::run_external_name_loop(
        state.clone(),
        Arc::new(SystemResolver),
        Duration::from_secs(config.external_name_sync_interval_secs.max(1)),
    ));

    let admin_state = state.clone();
    let admin = config.admin_listener.clone();
    tokio::spawn(async move {
        let service = admin_service::AdminService::new(admin_state);
        if let Err(err) = shared::http::run_http_service(&admin.host, admin.port, service).await {
            tracing::error!(error = %err, "admin listener failed");
        }
    });

    serve_gateway(config, state).await
}

async fn serve_gateway(config: config::Config, state: Arc<GatewayState>) -> Result<(), ProxyError> {
    let listener =
        TcpListener::bind(format!("{}:{}", config.listener.host, config.listener.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");

    let gateway = Arc::new(Gateway::new(state));

    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let service = GatewayService {
            gateway: gateway.clone(),
            peer,
        };

        // Hand the connection to hyper; auto-detect h1/h2 on this socket.
        tokio::spawn(async move {
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}
