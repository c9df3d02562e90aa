//! plfm-vt balancer library.
//!
//! A TCP load balancer for gRPC that reads just enough of each connection
//! to learn the method being called, then races the call across several
//! backends and keeps the first one to answer.

pub mod call;
pub mod config;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod registry;

pub use call::{CallArgs, RoutingKey};
pub use error::BalancerError;
pub use policy::{BackendAddr, Policy, PolicyError};
pub use proxy::{run, CallOutcome, Listener, ListenerConfig, ListenerStats};
