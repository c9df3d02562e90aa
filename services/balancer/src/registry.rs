//! Method registry client.
//!
//! The registry maps a fully-qualified gRPC method to the backends serving
//! it. The balancer polls it and feeds the results into a [`MethodRouter`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::policy::{BackendAddr, MethodRouter};

/// Errors returned by a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("method not registered: {0}")]
    UnknownMethod(String),

    #[error("registry query failed (status={status}): {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid routing metadata: {0}")]
    InvalidMetadata(String),
}

/// Backends registered for one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub method: String,
    pub backends: Vec<BackendAddr>,
    #[serde(default)]
    pub version: u64,
}

/// Source of routing metadata.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve the backends serving `method` (`package.Service/Method`).
    async fn resolve(&self, method: &str) -> Result<RoutingMetadata, RegistryError>;
}

/// Registry reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("plfm-balancer/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn resolve(&self, method: &str) -> Result<RoutingMetadata, RegistryError> {
        let base = self.base_url.trim_end_matches('/');
        let method = method.trim_start_matches('/');
        let url = format!("{base}/v1/methods/{method}");

        let resp = self.client.get(url).send().await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::UnknownMethod(method.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Status { status, body });
        }

        let metadata = resp.json::<RoutingMetadata>().await?;
        if metadata.method != method {
            return Err(RegistryError::InvalidMetadata(format!(
                "asked for {method}, got {}",
                metadata.method
            )));
        }
        Ok(metadata)
    }
}

/// In-memory registry.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    entries: HashMap<String, RoutingMetadata>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: impl Into<String>, backends: Vec<BackendAddr>) {
        let method = method.into();
        let version = self.entries.get(&method).map_or(1, |m| m.version + 1);
        self.entries.insert(
            method.clone(),
            RoutingMetadata {
                method,
                backends,
                version,
            },
        );
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn resolve(&self, method: &str) -> Result<RoutingMetadata, RegistryError> {
        let method = method.trim_start_matches('/');
        self.entries
            .get(method)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMethod(method.to_string()))
    }
}

/// Resolve every method once and apply the results to `router`.
///
/// A method that fails to resolve keeps whatever backends the router had.
/// Returns the number of methods updated.
pub async fn refresh_once(
    registry: &dyn Registry,
    router: &MethodRouter,
    methods: &[String],
) -> usize {
    let mut updated = 0;

    for method in methods {
        match registry.resolve(method).await {
            Ok(metadata) => {
                debug!(
                    method = %metadata.method,
                    version = metadata.version,
                    backend_count = metadata.backends.len(),
                    "Resolved method"
                );
                router.update(&metadata.method, metadata.backends);
                updated += 1;
            }
            Err(e) => {
                warn!(method = %method, error = %e, "Failed to resolve method; keeping previous backends");
            }
        }
    }

    updated
}

/// Refresh the router from the registry every `interval`, forever.
pub async fn run_refresh_loop(
    registry: Arc<dyn Registry>,
    router: Arc<MethodRouter>,
    methods: Vec<String>,
    interval: Duration,
) {
    info!(
        method_count = methods.len(),
        interval_ms = interval.as_millis() as u64,
        "Starting registry refresh loop"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let updated = refresh_once(registry.as_ref(), &router, &methods).await;
        debug!(updated, "Registry refresh complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallArgs, RoutingKey};
    use crate::policy::{Policy, PolicyError};

    fn addrs(raw: &[&str]) -> Vec<BackendAddr> {
        raw.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_static_registry_resolve() {
        let mut registry = StaticRegistry::new();
        registry.insert("svc.A/Call", addrs(&["a:1"]));
        registry.insert("svc.A/Call", addrs(&["a:1", "a:2"]));

        let metadata = registry.resolve("/svc.A/Call").await.unwrap();
        assert_eq!(metadata.backends, addrs(&["a:1", "a:2"]));
        assert_eq!(metadata.version, 2);

        assert!(matches!(
            registry.resolve("svc.B/Call").await,
            Err(RegistryError::UnknownMethod(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_keeps_previous_on_failure() {
        let router = MethodRouter::new(0);
        router.update("svc.B/Call", addrs(&["old:1"]));

        let mut registry = StaticRegistry::new();
        registry.insert("svc.A/Call", addrs(&["a:1"]));

        let methods = vec!["svc.A/Call".to_string(), "svc.B/Call".to_string()];
        let updated = refresh_once(&registry, &router, &methods).await;

        assert_eq!(updated, 1);
        assert_eq!(router.backends("svc.A/Call"), Some(addrs(&["a:1"])));
        assert_eq!(router.backends("svc.B/Call"), Some(addrs(&["old:1"])));
    }

    #[tokio::test]
    async fn test_unregistered_method_has_no_candidates() {
        let router = MethodRouter::new(0);
        let registry = StaticRegistry::new();
        refresh_once(&registry, &router, &["svc.A/Call".to_string()]).await;

        let key: RoutingKey = "svc.A/Call".parse().unwrap();
        assert!(matches!(
            router.choose_candidates(&key, &CallArgs::new()),
            Err(PolicyError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_metadata_json() {
        let metadata: RoutingMetadata = serde_json::from_value(serde_json::json!({
            "method": "svc.A/Call",
            "backends": ["10.0.0.1:50051", "[::1]:50052"]
        }))
        .unwrap();
        assert_eq!(metadata.version, 0);
        assert_eq!(metadata.backends.len(), 2);

        let bad = serde_json::from_value::<RoutingMetadata>(serde_json::json!({
            "method": "svc.A/Call",
            "backends": ["no-port"]
        }));
        assert!(bad.is_err());
    }
}
