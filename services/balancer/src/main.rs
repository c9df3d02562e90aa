//! plfm-vt Balancer
//!
//! Method-aware gRPC balancer with speculative fan-out.
//!
//! This service:
//! - Accepts gRPC (HTTP/2 cleartext) connections
//! - Reads the method of the first call on each connection
//! - Races that connection across candidate backends
//! - Keeps the first backend to respond and drops the rest
//! - Optionally resolves per-method backends from a registry

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_balancer::config::{Config, PolicyKind};
use plfm_balancer::policy::{FixedN, LatencyRanked, MethodRouter, RacingN, RandomPick};
use plfm_balancer::registry::{self, HttpRegistry, Registry};
use plfm_balancer::{Listener, Policy};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GHOST_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt balancer");
    info!(
        listen_addr = %config.listen_addr,
        policy = %config.policy,
        fanout = config.fanout,
        backend_count = config.backends.len(),
        registry = config.registry.as_ref().map(|r| r.url.as_str()),
        "Configuration loaded"
    );

    let policy = build_policy(&config).await?;

    let listener = match Listener::bind(config.listener_config(), policy).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    listener.run().await.context("Listener failed")
}

async fn build_policy(config: &Config) -> Result<Arc<dyn Policy>> {
    let Some(registry_config) = &config.registry else {
        let backends = config.backends.clone();
        let policy: Arc<dyn Policy> = match config.policy {
            PolicyKind::Fixed => Arc::new(FixedN::new(backends, config.fanout)),
            PolicyKind::Random => Arc::new(RandomPick::new(backends)),
            PolicyKind::Racing => Arc::new(RacingN::new(backends, config.fanout)),
            PolicyKind::Fastest => Arc::new(LatencyRanked::new(backends, config.fanout)),
        };
        return Ok(policy);
    };

    let registry: Arc<dyn Registry> = Arc::new(
        HttpRegistry::new(registry_config.url.clone()).context("Failed to build registry client")?,
    );
    let router = Arc::new(MethodRouter::new(config.fanout));

    // Resolve once up front so the first calls have somewhere to go.
    let resolved =
        registry::refresh_once(registry.as_ref(), &router, &registry_config.methods).await;
    info!(
        resolved,
        method_count = registry_config.methods.len(),
        "Initial registry resolution complete"
    );

    tokio::spawn(registry::run_refresh_loop(
        registry,
        Arc::clone(&router),
        registry_config.methods.clone(),
        registry_config.refresh_interval,
    ));

    let policy: Arc<dyn Policy> = router;
    Ok(policy)
}
