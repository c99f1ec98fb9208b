//! classgraph-hub: runs the collaboration server.
//!
//! Environment:
//! - `CLASSGRAPH_BIND`: listen address (default `127.0.0.1:9090`)
//! - `CLASSGRAPH_DATA`: RocksDB directory; unset keeps documents in memory
//! - `CLASSGRAPH_CAPACITY`: per-room broadcast buffer (default 256)
//! - `CLASSGRAPH_DEFAULT_ROLE`: role for users without a grant (default `viewer`)
//! - `RUST_LOG`: log filter
//!
//! Ctrl-C closes every connection and saves open rooms before exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use classgraph_collab::{DocumentStore, Role, ServerConfig, StaticMembership, SyncServer};
use log::{error, info, warn};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("CLASSGRAPH_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(dir) = std::env::var("CLASSGRAPH_DATA") {
        config.storage_path = Some(PathBuf::from(dir));
    }
    if let Ok(capacity) = std::env::var("CLASSGRAPH_CAPACITY") {
        match capacity.parse() {
            Ok(n) => config.broadcast_capacity = n,
            Err(_) => warn!("Ignoring CLASSGRAPH_CAPACITY={capacity:?}"),
        }
    }
    config
}

fn default_role_from_env() -> Role {
    match std::env::var("CLASSGRAPH_DEFAULT_ROLE") {
        Ok(raw) => Role::parse(&raw).unwrap_or_else(|| {
            warn!("Unknown CLASSGRAPH_DEFAULT_ROLE={raw:?}, using viewer");
            Role::Viewer
        }),
        Err(_) => Role::Viewer,
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    let membership = Arc::new(StaticMembership::new(default_role_from_env()));
    info!(
        "Starting classgraph hub (storage: {}, default role: {})",
        config
            .storage_path
            .as_ref()
            .map_or("memory".to_string(), |p| p.display().to_string()),
        membership.default_role()
    );

    let server = match SyncServer::open(config, membership) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open document store: {e}");
            std::process::exit(1);
        }
    };

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            stopper.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
    // Connection cleanup saves each room as it empties.
    if !server.drain(Duration::from_secs(5)).await {
        warn!("Connections still open after 5s, exiting anyway");
    }
    if let Err(e) = server.hub().store().flush() {
        error!("Failed to flush document store: {e}");
    }
}
