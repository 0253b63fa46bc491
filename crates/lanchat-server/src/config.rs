//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration on a LAN.

use std::net::SocketAddr;
use std::path::PathBuf;

use lanchat_shared::constants::{DEFAULT_HTTP_PORT, MAX_UPLOAD_SIZE, REGISTERED_USERS_FILE};
use lanchat_shared::types::PeerIp;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for HTTP and the WebSocket endpoint.
    /// Env: `HTTP_ADDR`, or `PORT` to change only the port.
    /// Default: `0.0.0.0:4000`
    pub http_addr: SocketAddr,

    /// Root directory holding one subdirectory per chat pair.
    /// Env: `CHATS_DIR`
    /// Default: `./chats`
    pub chats_dir: PathBuf,

    /// JSON file listing every peer ever seen.
    /// Env: `REGISTERED_USERS_PATH`
    /// Default: `./registered_users.json`
    pub registered_users_path: PathBuf,

    /// Maximum request body size for `POST /upload`, in bytes.
    /// Env: `MAX_UPLOAD_SIZE`
    /// Default: 500 MiB
    pub max_upload_size: usize,

    /// Address substituted for loopback clients. Detected from the network
    /// interfaces when unset.
    /// Env: `HOST_IP`
    pub host_ip: Option<PeerIp>,

    /// Directory of a built web frontend to serve at `/`.
    /// Env: `STATIC_DIR`
    /// Default: unset (no frontend served).
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            chats_dir: PathBuf::from("./chats"),
            registered_users_path: PathBuf::from(format!("./{REGISTERED_USERS_FILE}")),
            max_upload_size: MAX_UPLOAD_SIZE,
            host_ip: None,
            static_dir: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(port) = var("PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.http_addr.set_port(port),
                Err(_) => tracing::warn!(value = %port, "Invalid PORT, ignoring"),
            }
        }

        if let Some(path) = var("CHATS_DIR") {
            config.chats_dir = PathBuf::from(path);
        }

        if let Some(path) = var("REGISTERED_USERS_PATH") {
            config.registered_users_path = PathBuf::from(path);
        }

        if let Some(val) = var("MAX_UPLOAD_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_upload_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_UPLOAD_SIZE, using default"),
            }
        }

        if let Some(ip) = var("HOST_IP") {
            match PeerIp::parse(&ip) {
                Ok(ip) => config.host_ip = Some(ip),
                Err(e) => tracing::warn!(error = %e, "Invalid HOST_IP, detecting instead"),
            }
        }

        if let Some(dir) = var("STATIC_DIR").filter(|d| !d.is_empty()) {
            config.static_dir = Some(PathBuf::from(dir));
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
