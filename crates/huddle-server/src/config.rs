//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use huddle_shared::constants::DEFAULT_HTTP_PORT;

/// Password given to the seeded super-admin when none is configured.
pub const DEFAULT_SUPER_ADMIN_PASSWORD: &str = "123";

/// Where documents are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// SQLite file on disk.
    File(PathBuf),
    /// Process-local store, lost on exit.
    Memory,
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API and websocket relay.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3000`
    pub http_addr: SocketAddr,

    /// Document storage.
    /// Env: `DATABASE_PATH` (`:memory:` selects the in-process store)
    /// Default: `./huddle.db`
    pub storage: StorageLocation,

    /// Upper bound on a single store call.
    /// Env: `STORE_TIMEOUT_MS`
    /// Default: 5000
    pub store_timeout: Duration,

    /// How many times the user purge cascade is attempted before giving up.
    /// Env: `CASCADE_ATTEMPTS`
    /// Default: 3
    pub cascade_attempts: u32,

    /// Per-connection relay mailbox depth. Dispatches to a full mailbox are
    /// dropped.
    /// Env: `SESSION_MAILBOX`
    /// Default: 256
    pub session_mailbox: usize,

    /// Also append relayed chat messages to the channel log.
    /// Env: `RELAY_PERSIST_MESSAGES` (true/false)
    /// Default: `false`
    pub relay_persist_messages: bool,

    /// Create the `super` account when the users collection is empty.
    /// Env: `SEED_SUPER_ADMIN` (true/false)
    /// Default: `true`
    pub seed_super_admin: bool,

    /// Password for the seeded super-admin.
    /// Env: `SUPER_ADMIN_PASSWORD`
    pub super_admin_password: String,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("storage", &self.storage)
            .field("store_timeout", &self.store_timeout)
            .field("cascade_attempts", &self.cascade_attempts)
            .field("session_mailbox", &self.session_mailbox)
            .field("relay_persist_messages", &self.relay_persist_messages)
            .field("seed_super_admin", &self.seed_super_admin)
            .field("super_admin_password", &"<redacted>")
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            storage: StorageLocation::File(PathBuf::from("./huddle.db")),
            store_timeout: Duration::from_millis(5000),
            cascade_attempts: 3,
            session_mailbox: 256,
            relay_persist_messages: false,
            seed_super_admin: true,
            super_admin_password: DEFAULT_SUPER_ADMIN_PASSWORD.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            config.http_addr = parse_or("HTTP_ADDR", &addr, config.http_addr);
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.storage = if path == ":memory:" {
                StorageLocation::Memory
            } else {
                StorageLocation::File(PathBuf::from(path))
            };
        }

        if let Some(val) = lookup("STORE_TIMEOUT_MS") {
            let millis = parse_or("STORE_TIMEOUT_MS", &val, 5000u64);
            config.store_timeout = Duration::from_millis(millis.max(1));
        }

        if let Some(val) = lookup("CASCADE_ATTEMPTS") {
            config.cascade_attempts = parse_or("CASCADE_ATTEMPTS", &val, config.cascade_attempts).max(1);
        }

        if let Some(val) = lookup("SESSION_MAILBOX") {
            config.session_mailbox = parse_or("SESSION_MAILBOX", &val, config.session_mailbox).max(1);
        }

        if let Some(val) = lookup("RELAY_PERSIST_MESSAGES") {
            config.relay_persist_messages = flag(&val);
        }

        if let Some(val) = lookup("SEED_SUPER_ADMIN") {
            config.seed_super_admin = flag(&val);
        }

        match lookup("SUPER_ADMIN_PASSWORD") {
            Some(password) if !password.is_empty() => config.super_admin_password = password,
            _ => {
                if config.seed_super_admin {
                    tracing::warn!("SUPER_ADMIN_PASSWORD not set, seeding with the default dev password");
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_or<T: FromStr>(key: &str, value: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!(key, value, "Invalid value, using default");
            default
        }
    }
}

fn flag(value: &str) -> bool {
    value != "false" && value != "0"
}
