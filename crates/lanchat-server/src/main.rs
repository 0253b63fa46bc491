//! # lanchat-server
//!
//! LAN chat relay server.
//!
//! This binary provides:
//! - **Presence tracking** of connected peers, identified by their address
//! - **Live relay** of messages over a WebSocket at `/socket`
//! - **Chat history** persisted per peer pair as JSON files on disk
//! - **File attachments** uploaded over HTTP and served back per pair

mod api;
mod config;
mod error;
mod identity;
mod presence;
mod relay;
mod socket;

use std::sync::Arc;

use lanchat_store::{migrations, ChatLogStore, UserStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::identity::{detect_host_ipv4, LoopbackAwareResolver};
use crate::relay::RelayEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,lanchat_server=debug,lanchat_store=debug")
            }),
        )
        .init();

    info!("Starting LAN chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the stores and bring old chat logs up to date
    // -----------------------------------------------------------------------
    let users = Arc::new(UserStore::open(config.registered_users_path.clone()).await?);
    let chats = Arc::new(ChatLogStore::open(config.chats_dir.clone()).await?);

    let report = migrations::backfill_messages(&config.chats_dir).await?;
    info!(
        scanned = report.logs_scanned,
        rewritten = report.logs_rewritten,
        updated = report.messages_updated,
        skipped = report.logs_skipped,
        "Chat log migration finished"
    );

    // -----------------------------------------------------------------------
    // 4. Resolve the host address used for loopback clients
    // -----------------------------------------------------------------------
    let host_ip = match config.host_ip.clone() {
        Some(ip) => {
            info!(ip = %ip, "Using configured host address");
            ip
        }
        None => detect_host_ipv4(),
    };

    // -----------------------------------------------------------------------
    // 5. Build the relay and the application state
    // -----------------------------------------------------------------------
    let relay = Arc::new(RelayEngine::new(users, chats.clone()));
    let resolver = LoopbackAwareResolver::new(host_ip);
    info!(host = %resolver.host_ip(), "Loopback clients will be identified as the host");

    let app_state = AppState {
        relay,
        chats,
        resolver: Arc::new(resolver),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 6. Run the HTTP server (blocks until Ctrl+C)
    // -----------------------------------------------------------------------
    if let Err(e) = api::serve(app_state, config.http_addr).await {
        tracing::error!(error = %e, "HTTP server failed");
        return Err(e);
    }

    info!("Server stopped");
    Ok(())
}
