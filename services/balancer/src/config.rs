//! Balancer configuration.
//!
//! Everything is env-driven. `from_lookup` takes the variable source as a
//! closure so tests do not touch the process environment.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::policy::BackendAddr;
use crate::proxy::{FanoutConfig, InspectConfig, ListenerConfig};

/// Candidate selection strategy for static backend lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// The first N configured backends.
    Fixed,
    /// One backend chosen uniformly at random.
    Random,
    /// The first N backends, or all of them with N = 0.
    Racing,
    /// The N backends with the lowest observed latency.
    Fastest,
}

impl FromStr for PolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "random" => Ok(Self::Random),
            "racing" => Ok(Self::Racing),
            "fastest" => Ok(Self::Fastest),
            other => bail!("unknown policy {other:?} (expected fixed, random, racing or fastest)"),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fixed => "fixed",
            Self::Random => "random",
            Self::Racing => "racing",
            Self::Fastest => "fastest",
        })
    }
}

/// Registry-fed routing settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry base URL (example: http://localhost:8080).
    pub url: String,
    /// Methods to resolve, as `package.Service/Method`.
    pub methods: Vec<String>,
    /// Interval between refreshes.
    pub refresh_interval: Duration,
}

/// Balancer configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the balancer listens on.
    pub listen_addr: SocketAddr,

    /// Static backend list.
    pub backends: Vec<BackendAddr>,

    /// Strategy used with the static backend list.
    pub policy: PolicyKind,

    /// Fan-out width (0 = all, racing only).
    pub fanout: usize,

    /// Per-candidate dial timeout.
    pub dial_timeout: Duration,

    /// Bound on routing-key extraction time.
    pub peek_timeout: Duration,

    /// Bound on captured prefix size.
    pub max_peek_bytes: usize,

    /// Maximum concurrent inbound connections.
    pub max_connections: usize,

    /// Registry-fed routing, if enabled.
    pub registry: Option<RegistryConfig>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("GHOST_BALANCER_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:50051".to_string())
            .parse()
            .context("GHOST_BALANCER_LISTEN_ADDR must be a socket address (host:port).")?;

        let backends = lookup("GHOST_BALANCER_BACKENDS")
            .map(|v| BackendAddr::parse_list(&v))
            .transpose()
            .context("GHOST_BALANCER_BACKENDS must be a comma-separated list of host:port.")?
            .unwrap_or_default();

        let policy = lookup("GHOST_BALANCER_POLICY")
            .map(|v| v.parse::<PolicyKind>())
            .transpose()
            .context("Invalid GHOST_BALANCER_POLICY.")?
            .unwrap_or(PolicyKind::Racing);

        let fanout: usize = parse_var(&lookup, "GHOST_BALANCER_FANOUT", "an integer")?
            .unwrap_or(2);

        let dial_timeout_ms: u64 = parse_var(
            &lookup,
            "GHOST_BALANCER_DIAL_TIMEOUT_MS",
            "an integer (milliseconds)",
        )?
        .unwrap_or(2000);

        let peek_timeout_ms: u64 = parse_var(
            &lookup,
            "GHOST_BALANCER_PEEK_TIMEOUT_MS",
            "an integer (milliseconds)",
        )?
        .unwrap_or(2000);

        let max_peek_bytes: usize =
            parse_var(&lookup, "GHOST_BALANCER_MAX_PEEK_BYTES", "an integer")?
                .unwrap_or(64 * 1024)
                .max(1024);

        let max_connections: usize =
            parse_var(&lookup, "GHOST_BALANCER_MAX_CONNECTIONS", "an integer")?
                .unwrap_or(10000)
                .max(1);

        let registry = match lookup("GHOST_BALANCER_REGISTRY_URL").filter(|v| !v.is_empty()) {
            Some(url) => {
                let methods = lookup("GHOST_BALANCER_REGISTRY_METHODS")
                    .map(|v| {
                        v.split(',')
                            .map(|m| m.trim().trim_start_matches('/').to_string())
                            .filter(|m| !m.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();

                let refresh_ms: u64 = parse_var(
                    &lookup,
                    "GHOST_BALANCER_REGISTRY_REFRESH_MS",
                    "an integer (milliseconds)",
                )?
                .unwrap_or(30_000);

                Some(RegistryConfig {
                    url,
                    methods,
                    refresh_interval: Duration::from_millis(refresh_ms.max(100)),
                })
            }
            None => None,
        };

        if registry.is_none() && backends.is_empty() {
            bail!("No backends. Set GHOST_BALANCER_BACKENDS or GHOST_BALANCER_REGISTRY_URL.");
        }

        let log_level = lookup("GHOST_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            backends,
            policy,
            fanout,
            dial_timeout: Duration::from_millis(dial_timeout_ms.max(10)),
            peek_timeout: Duration::from_millis(peek_timeout_ms.max(10)),
            max_peek_bytes,
            max_connections,
            registry,
            log_level,
        })
    }

    /// Listener settings derived from this configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen_addr);
        config.max_connections = self.max_connections;
        config.inspect = InspectConfig {
            timeout: self.peek_timeout,
            max_bytes: self.max_peek_bytes,
        };
        config.fanout = FanoutConfig {
            dial_timeout: self.dial_timeout,
            ..FanoutConfig::default()
        };
        config
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, expected: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be {expected}."))
}
