//! # huddle-server
//!
//! Group chat and call signaling server.
//!
//! This binary provides:
//! - **REST API** (axum) for accounts, groups, channels and message logs,
//!   with role checks on every mutating call
//! - **Websocket relay** that forwards WebRTC offers, answers and ICE
//!   candidates between channel participants, holding candidates back until
//!   the matching description has been delivered
//! - **Document store** backed by SQLite, or kept in memory for throwaway
//!   instances

mod api;
mod config;
mod error;
mod groups;
mod registry;
mod relay;
mod session;
mod users;
mod ws;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use huddle_store::{Database, DocumentStore, MembershipStore, MemoryStore};

use crate::api::AppState;
use crate::config::{ServerConfig, StorageLocation, DEFAULT_SUPER_ADMIN_PASSWORD};
use crate::groups::GroupService;
use crate::registry::ChannelRegistry;
use crate::relay::RelayContext;
use crate::users::{Passwords, UserService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,huddle_server=debug,huddle_store=debug")),
        )
        .init();

    info!("Starting huddle server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the document store
    // -----------------------------------------------------------------------
    let docs: Arc<dyn DocumentStore> = match &config.storage {
        StorageLocation::File(path) => {
            let db = Database::open_at(path)?;
            info!(path = %path.display(), "Opened SQLite document store");
            Arc::new(db)
        }
        StorageLocation::Memory => {
            warn!("Using the in-memory document store; data is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let store = Arc::new(
        MembershipStore::new(docs)
            .with_timeout(config.store_timeout)
            .with_cascade_attempts(config.cascade_attempts),
    );

    let users = UserService::new(Arc::clone(&store), Passwords::default());
    if config.seed_super_admin {
        if config.super_admin_password == DEFAULT_SUPER_ADMIN_PASSWORD {
            warn!("SUPER_ADMIN_PASSWORD not set; the seeded super admin uses the default password");
        }
        if users.seed_super_admin(&config.super_admin_password).await? {
            info!("Users collection was empty; created the super admin account");
        }
    }

    // -----------------------------------------------------------------------
    // 4. Assemble the HTTP and relay state
    // -----------------------------------------------------------------------
    let app_state = AppState {
        groups: GroupService::new(Arc::clone(&store)),
        users,
        relay: RelayContext {
            registry: ChannelRegistry::new(),
            store: Arc::clone(&store),
            persist_messages: config.relay_persist_messages,
            mailbox: config.session_mailbox,
        },
        store,
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
