use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tivi_proto::api::IceServer;
use tracing::warn;

use crate::rate_limit::RateLimitConfig;

/// Signing secret used when none is configured. Fine for local development only.
pub const DEV_JWT_SECRET: &str = "dev-secret-change-in-production";

/// Longest token lifetime accepted: one year.
pub const MAX_TOKEN_TTL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_url: None,
            turn_username: None,
            turn_password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub cors_origin: String,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    // Authentication
    pub jwt_secret: String,
    pub token_ttl_secs: u64,

    // Websocket
    pub max_message_size: usize,

    // Rate limiting
    pub rate_limit: RateLimitConfig,
    pub allowlist: Vec<String>,
    pub blocklist: Vec<String>,

    // NAT traversal servers handed to clients
    pub ice: IceConfig,

    // Graceful shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            cors_origin: "http://localhost:3000".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            token_ttl_secs: 24 * 60 * 60,
            max_message_size: 64 * 1024, // 64KB
            rate_limit: RateLimitConfig::default(),
            allowlist: Vec::new(),
            blocklist: Vec::new(),
            ice: IceConfig::default(),
            shutdown_timeout_secs: 30,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_var("TIVI_BIND_ADDR") {
            config.bind_addr = addr.parse().context("TIVI_BIND_ADDR")?;
        }

        if let Some(origin) = env_var("TIVI_CORS_ORIGIN") {
            config.cors_origin = origin;
        }

        if let Some(secret) = env_var("TIVI_JWT_SECRET") {
            config.jwt_secret = secret;
        }

        if let Some(ttl) = env_var("TIVI_TOKEN_TTL_SECS") {
            config.token_ttl_secs = ttl.parse().context("TIVI_TOKEN_TTL_SECS")?;
        }

        config.tls_cert_path = env_var("TIVI_TLS_CERT_PATH").map(PathBuf::from);
        config.tls_key_path = env_var("TIVI_TLS_KEY_PATH").map(PathBuf::from);

        if let Some(size) = env_var("TIVI_MAX_MESSAGE_SIZE") {
            config.max_message_size = size.parse().context("TIVI_MAX_MESSAGE_SIZE")?;
        }

        if let Some(urls) = env_var("TIVI_STUN_URLS") {
            config.ice.stun_urls = split_list(&urls);
        }
        config.ice.turn_url = env_var("TIVI_TURN_URL");
        config.ice.turn_username = env_var("TIVI_TURN_USERNAME");
        config.ice.turn_password = env_var("TIVI_TURN_PASSWORD");

        if let Some(ips) = env_var("TIVI_ALLOWLIST") {
            config.allowlist = split_list(&ips);
        }
        if let Some(ips) = env_var("TIVI_BLOCKLIST") {
            config.blocklist = split_list(&ips);
        }

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jwt_secret.is_empty() {
            anyhow::bail!("jwt_secret must not be empty");
        }

        if self.token_ttl_secs == 0 {
            anyhow::bail!("token_ttl_secs must be > 0");
        }

        if self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            anyhow::bail!("token_ttl_secs must be at most {}", MAX_TOKEN_TTL_SECS);
        }

        if self.max_message_size == 0 {
            anyhow::bail!("max_message_size must be > 0");
        }

        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be > 0");
        }

        if let (Some(_), None) | (None, Some(_)) = (&self.tls_cert_path, &self.tls_key_path) {
            anyhow::bail!("both tls_cert_path and tls_key_path must be set or both unset");
        }

        if self.cors_origin != "*" && axum::http::HeaderValue::from_str(&self.cors_origin).is_err() {
            anyhow::bail!("cors_origin is not a valid header value: {}", self.cors_origin);
        }

        if self.jwt_secret == DEV_JWT_SECRET {
            warn!("using the development JWT secret; set TIVI_JWT_SECRET in production");
        }

        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.tls_cert_path.as_ref().zip(self.tls_key_path.as_ref())
    }

    /// STUN entries first, then the TURN relay if one is configured.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers: Vec<IceServer> = self
            .ice
            .stun_urls
            .iter()
            .map(|url| IceServer {
                urls: vec![url.clone()],
                username: None,
                credential: None,
            })
            .collect();

        if let Some(turn) = &self.ice.turn_url {
            servers.push(IceServer {
                urls: vec![turn.clone()],
                username: self.ice.turn_username.clone(),
                credential: self.ice.turn_password.clone(),
            });
        }
        servers
    }
}
