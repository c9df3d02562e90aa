//! TCP listener and connection handling.
//!
//! This module owns the listening socket, accepts connections and runs one
//! pipeline per connection:
//! - Wrap the stream in a peeking adapter
//! - Extract the routing key of the first call
//! - Ask the policy for candidate backends
//! - Race the call across the candidates
//!
//! Any terminal failure closes the client connection without a response.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::fanout::{Coordinator, FanoutConfig};
use super::inspect::{FrameInspector, InspectConfig};
use crate::error::BalancerError;
use crate::policy::Policy;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Routing-key extraction configuration.
    pub inspect: InspectConfig,
    /// Fan-out configuration.
    pub fanout: FanoutConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            inspect: InspectConfig::default(),
            fanout: FanoutConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Routing keys extracted.
    pub keys_extracted: AtomicU64,
    /// Routing-key extraction failures (malformed, timeout, closed).
    pub inspect_failed: AtomicU64,
    /// Calls for which the policy had no candidates.
    pub no_candidates: AtomicU64,
    /// Calls whose winner response was fully forwarded.
    pub calls_completed: AtomicU64,
    /// Calls that ended without a complete response.
    pub calls_aborted: AtomicU64,
    /// Backend connections established.
    pub backend_dials: AtomicU64,
    /// Backend connection failures.
    pub backend_dial_failures: AtomicU64,
    /// Bytes forwarded from winners to clients.
    pub bytes_to_client: AtomicU64,
}

/// A TCP listener for the balancer.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Policy choosing candidates per call.
    policy: Arc<dyn Policy>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Routing-key extraction.
    inspector: FrameInspector,
    /// Fan-out coordinator.
    coordinator: Coordinator,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, policy: Arc<dyn Policy>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            policy = policy.name(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            inspector: FrameInspector::with_config(config.inspect),
            coordinator: Coordinator::new(config.fanout, Arc::clone(&policy)),
            listener,
            policy,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Shared handle to the statistics.
    pub fn stats_handle(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream).await {
                                debug!(
                                    reason = e.reason_code(),
                                    error = %e,
                                    "Connection closed without a response"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, client: TcpStream) -> Result<(), BalancerError> {
        let _ = client.set_nodelay(true);
        let mut conn = self.inspector.wrap(client);

        let call = match self.inspector.extract_routing_key(&mut conn).await {
            Ok(call) => {
                self.stats.keys_extracted.fetch_add(1, Ordering::Relaxed);
                call
            }
            Err(e) => {
                self.stats.inspect_failed.fetch_add(1, Ordering::Relaxed);
                let _ = conn.close().await;
                return Err(e);
            }
        };

        let candidates = match self.policy.choose_candidates(&call.key, &call.args) {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                self.stats.no_candidates.fetch_add(1, Ordering::Relaxed);
                let _ = conn.close().await;
                return Err(crate::policy::PolicyError::NoBackends.into());
            }
            Err(e) => {
                self.stats.no_candidates.fetch_add(1, Ordering::Relaxed);
                warn!(routing_key = %call.key, error = %e, "No candidates");
                let _ = conn.close().await;
                return Err(e.into());
            }
        };

        let (client, prefix) = conn.into_parts();
        let span = tracing::debug_span!(
            "call",
            routing_key = %call.key,
            candidates = candidates.len()
        );

        match self
            .coordinator
            .forward(client, prefix, candidates)
            .instrument(span)
            .await
        {
            Ok(outcome) => {
                self.stats.calls_completed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .backend_dials
                    .fetch_add(outcome.dialed as u64, Ordering::Relaxed);
                self.stats
                    .backend_dial_failures
                    .fetch_add(outcome.dial_failures as u64, Ordering::Relaxed);
                self.stats
                    .bytes_to_client
                    .fetch_add(outcome.response_bytes, Ordering::Relaxed);

                debug!(
                    routing_key = %call.key,
                    winner = %outcome.winner,
                    raced = outcome.dialed,
                    response_bytes = outcome.response_bytes,
                    first_byte_ms = outcome.first_byte_latency.as_millis() as u64,
                    "Call completed"
                );
                Ok(())
            }
            Err(e) => {
                self.stats.calls_aborted.fetch_add(1, Ordering::Relaxed);
                if let BalancerError::BackendUnavailable { attempted } = &e {
                    self.stats
                        .backend_dial_failures
                        .fetch_add(*attempted as u64, Ordering::Relaxed);
                    warn!(routing_key = %call.key, attempted, "All candidates unreachable");
                }
                Err(e)
            }
        }
    }
}

/// Bind `listen_addr` and serve connections with `policy` until the
/// listener fails.
pub async fn run(listen_addr: SocketAddr, policy: Arc<dyn Policy>) -> io::Result<()> {
    let listener = Listener::bind(ListenerConfig::new(listen_addr), policy).await?;
    Arc::new(listener).run().await
}
