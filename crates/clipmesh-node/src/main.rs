//! ClipMesh node entry point.
//!
//! Wires together the infrastructure services and runs until interrupted.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()             -- TOML config from the platform dir
//!  └─ PeerStore::open()         -- trust lists + peer registry
//!  └─ start services
//!       ├─ ConnectionManager    -- TCP listener + pooled sends (Tokio)
//!       ├─ discovery listener   -- UDP announce responder (thread)
//!       ├─ discovery broadcaster-- periodic UDP announces (thread)
//!       └─ ClipboardSync poller -- local change detection (Tokio task)
//! ```
//!
//! The desktop front-end (status window, contact manager, tray icon) lives
//! outside this crate and drives the same [`PeerManager`]/[`ClipboardSync`]
//! facades; this binary runs the mesh headless with an in-memory clipboard,
//! which is also the configuration exercised by the integration tests.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clipmesh_core::SingleRetry;
use clipmesh_node::application::manage_peers::PeerManager;
use clipmesh_node::application::share_clipboard::ClipboardSync;
use clipmesh_node::infrastructure::clipboard::{Clipboard, InMemoryClipboard};
use clipmesh_node::infrastructure::network::connection_manager::ConnectionManager;
use clipmesh_node::infrastructure::network::discovery::{self, DiscoveryConfig};
use clipmesh_node::infrastructure::storage::config;
use clipmesh_node::infrastructure::storage::peer_store::PeerStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so its log level can seed the subscriber;
    // RUST_LOG still wins when set.
    let app_config = config::load_config().unwrap_or_else(|e| {
        eprintln!("could not load config ({e}); using defaults");
        config::AppConfig::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(app_config.general.log_level.clone())),
        )
        .init();

    info!(
        "ClipMesh node starting as '{}' on port {}",
        app_config.local_username(),
        app_config.current_port()
    );

    let state_dir = config::config_dir().context("resolving state directory")?;
    let store = Arc::new(PeerStore::open(&state_dir).context("opening peer store")?);
    let clipboard: Arc<dyn Clipboard> = Arc::new(InMemoryClipboard::new());

    // ── Connection manager ────────────────────────────────────────────────────
    let connections = Arc::new(ConnectionManager::new(
        app_config.current_port(),
        Arc::clone(&store),
        Arc::clone(&clipboard),
        Arc::new(SingleRetry),
    ));
    match connections.listen().await {
        Ok(port) => info!("connection manager listening on TCP {port}"),
        // Port in use is fatal to the TCP subsystem only; discovery still
        // lets this node appear in peer lists.
        Err(e) => error!("connection manager failed to start: {e}"),
    }

    // ── Discovery ─────────────────────────────────────────────────────────────
    let discovery_active = Arc::new(AtomicBool::new(true));
    let discovery_config = DiscoveryConfig {
        port: app_config.current_port(),
        username: app_config.local_username().to_string(),
        broadcast_interval: std::time::Duration::from_secs(app_config.broadcast_interval()),
    };
    match discovery::start_listener(&discovery_config, Arc::clone(&discovery_active)) {
        Ok(()) => {
            discovery::start_broadcaster(&discovery_config, Arc::clone(&discovery_active));
        }
        Err(e) => error!("discovery failed to start: {e}"),
    }

    // ── Clipboard poller ──────────────────────────────────────────────────────
    let poller_active = Arc::new(AtomicBool::new(true));
    let clipboard_sync = Arc::new(ClipboardSync::new(
        Arc::clone(&clipboard),
        Arc::clone(&connections),
    ));
    let poller = clipboard_sync.spawn_poller(Arc::clone(&poller_active));

    // The UI facade; constructed here so an embedding front-end receives it
    // ready-made. The headless binary keeps it alive for its log output only.
    let _peers = PeerManager::new(Arc::clone(&store), app_config.current_port());

    info!("ClipMesh node ready. Press Ctrl-C to exit.");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    // Stop order: quiesce discovery, stop the poller, then tear down
    // connections so peers see a clean close.
    discovery_active.store(false, Ordering::Relaxed);
    poller_active.store(false, Ordering::Relaxed);
    poller.abort();
    connections.stop().await;

    info!("ClipMesh node stopped");
    Ok(())
}
