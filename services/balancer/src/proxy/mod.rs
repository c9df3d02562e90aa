//! Method-aware TCP proxying with speculative fan-out.
//!
//! This module provides:
//! - TCP listener management
//! - A peeking adapter that captures what the frame parser consumes
//! - Routing-key extraction from the first gRPC request
//! - Racing one call across several backends
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> PeekingConn -> FrameInspector -> Policy
//!                                                          |
//!                         Coordinator <--------------------+
//!                          |   |   |
//!                     session session session -> Backend (first byte wins)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use plfm_balancer::policy::RacingN;
//! use plfm_balancer::proxy::{Listener, ListenerConfig};
//!
//! let policy = Arc::new(RacingN::all(backends));
//! let config = ListenerConfig::new("0.0.0.0:50051".parse()?);
//! let listener = Listener::bind(config, policy).await?;
//! Arc::new(listener).run().await?;
//! ```

mod fanout;
mod inspect;
mod listener;
mod peek;

pub use fanout::{
    CallOutcome, CallState, Coordinator, FanoutConfig, RaceGroup, DEFAULT_BUFFER_SIZE,
    DEFAULT_DIAL_TIMEOUT, DEFAULT_TAIL_QUEUE_DEPTH,
};
pub use inspect::{FrameInspector, InspectConfig, RoutedCall, DEFAULT_INSPECT_TIMEOUT};
pub use listener::{run, Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use peek::{PeekingConn, DEFAULT_MAX_PEEK_BYTES};
