#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use ssh_ws_bridge::tty::config::{
    TerminalConfig, resolve_compression, resolve_connect_timeout, resolve_host_keys,
    resolve_hosts_file, resolve_port, resolve_stats_interval,
};
use ssh_ws_bridge::tty::credentials::DashMapCredentialStore;
use ssh_ws_bridge::tty::handler::HostKeyPolicy;
use ssh_ws_bridge::tty::server::{AppState, routes};
use ssh_ws_bridge::tty::{BridgeOptions, ConnectorConfig, SessionHub, SshConnector};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let hosts_file = resolve_hosts_file(None);
    let credentials = DashMapCredentialStore::load_from_file(&hosts_file)?;

    let host_keys = HostKeyPolicy::parse(resolve_host_keys(None).as_deref());
    if matches!(host_keys, HostKeyPolicy::AcceptAny) {
        warn!("Host key verification disabled (accept-any)");
    }
    let connector = SshConnector::new(
        ConnectorConfig {
            timeout: resolve_connect_timeout(None),
            compress: resolve_compression(None),
        },
        host_keys,
    );

    let root = CancellationToken::new();
    let state = Arc::new(AppState {
        credentials: Arc::new(credentials),
        connector,
        hub: SessionHub::new(root.clone(), info_span!("hub")),
        terminal: TerminalConfig::from_env(),
        bridge: BridgeOptions::default(),
        stats_interval: resolve_stats_interval(None),
    });

    let addr = format!("0.0.0.0:{}", resolve_port(None));
    info!("Starting terminal bridge on {}", addr);

    Server::new(TcpListener::bind(addr))
        .name("SSH WebSocket Bridge")
        .run_with_graceful_shutdown(
            routes(state),
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down, closing live sessions");
                root.cancel();
            },
            Some(std::time::Duration::from_secs(5)),
        )
        .await?;

    Ok(())
}
