use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Default listener addresses
fn default_http_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("valid default HTTP address")
}

fn default_https_addr() -> SocketAddr {
    "0.0.0.0:443".parse().expect("valid default HTTPS address")
}

fn default_api_addr() -> SocketAddr {
    "0.0.0.0:81".parse().expect("valid default API address")
}

/// Request deadlines applied on the proxy data path
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Upstream connection establishment
    pub connect: Duration,
    /// Upstream response read
    pub read: Duration,
    /// Total per-request budget
    pub total: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(60),
            total: Duration::from_secs(120),
        }
    }
}

/// Runtime configuration resolved at startup.
///
/// The listener addresses and filesystem layout are fixed; the few
/// deployment-specific knobs come from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Plain HTTP proxy listener
    pub http_addr: SocketAddr,
    /// TLS proxy listener
    pub https_addr: SocketAddr,
    /// Admin API + static UI listener
    pub api_addr: SocketAddr,

    /// SQLite store location
    pub db_path: PathBuf,
    /// Per-certificate PEM material directory
    pub certs_dir: PathBuf,
    /// Newline-delimited request log
    pub access_log_path: PathBuf,
    /// Static UI assets served by the admin listener
    pub static_dir: PathBuf,

    /// Signing key for admin API tokens
    pub jwt_secret: String,
    /// Peers whose X-Forwarded-* headers are honored
    pub trusted_proxies: HashSet<IpAddr>,

    /// Contact email used for ACME account registration
    pub acme_email: String,

    /// Data-path deadlines
    pub timeouts: Timeouts,
    /// Drain window for in-flight work on shutdown
    pub shutdown_grace: Duration,
}

impl Config {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Self {
        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set; generating an ephemeral signing key");
            uuid::Uuid::new_v4().to_string()
        });

        let acme_email =
            std::env::var("ACME_EMAIL").unwrap_or_else(|_| "admin@example.com".to_string());

        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            api_addr: default_api_addr(),
            db_path: PathBuf::from("data/data.db"),
            certs_dir: PathBuf::from("data/certs"),
            access_log_path: PathBuf::from("logs/access.log"),
            static_dir: PathBuf::from("static"),
            jwt_secret,
            trusted_proxies: trusted_proxies_from_env(),
            acme_email,
            timeouts: Timeouts::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Parse the trusted proxy set from `PPM_TRUSTED_PROXY_IPS` (also accepted
/// as `TRUSTED_PROXY_IPS`). Loopback is always trusted.
fn trusted_proxies_from_env() -> HashSet<IpAddr> {
    let raw = std::env::var("PPM_TRUSTED_PROXY_IPS")
        .or_else(|_| std::env::var("TRUSTED_PROXY_IPS"))
        .unwrap_or_default();
    parse_trusted_proxies(&raw)
}

fn parse_trusted_proxies(raw: &str) -> HashSet<IpAddr> {
    let mut ips = HashSet::new();
    ips.insert(IpAddr::from([127, 0, 0, 1]));
    ips.insert(IpAddr::from([0, 0, 0, 0, 0, 0, 0, 1]));

    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.parse::<IpAddr>() {
            Ok(ip) => {
                ips.insert(ip);
            }
            Err(_) => warn!(entry = part, "Ignoring invalid trusted proxy IP"),
        }
    }

    ips
}
