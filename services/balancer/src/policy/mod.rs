//! Routing policies.
//!
//! A policy maps a routing key (plus optional call arguments) to an ordered,
//! non-empty list of candidate backends. The fan-out coordinator races every
//! candidate it is given; a policy that returns a single address therefore
//! turns the balancer into a plain proxy for that call.
//!
//! Built-in strategies:
//! - [`FixedN`]: the same first N configured backends on every call
//! - [`RandomPick`]: one backend chosen uniformly at random
//! - [`RacingN`]: the first N (or all) backends, to trigger racing
//! - [`LatencyRanked`]: the N backends with the lowest observed latency
//! - [`MethodRouter`]: per-method backend sets fed by the registry

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::{CallArgs, RoutingKey};

mod fixed;
mod latency;
mod methods;
mod racing;
mod random;

pub use fixed::FixedN;
pub use latency::{LatencyRanked, LatencyStats, LatencyTable};
pub use methods::MethodRouter;
pub use racing::RacingN;
pub use random::RandomPick;

/// Errors produced while choosing candidates.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The configured backend set is empty.
    #[error("no backends configured")]
    NoBackends,

    /// No backend set is known for this routing key.
    #[error("unknown routing key: {0}")]
    UnknownKey(String),

    /// A backend address is not of the form `host:port`.
    #[error("invalid backend address '{0}': expected host:port")]
    InvalidAddress(String),
}

/// A backend address in `host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendAddr(String);

impl BackendAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a comma-separated list, skipping empty entries.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, PolicyError> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for BackendAddr {
    type Err = PolicyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let valid = raw
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(PolicyError::InvalidAddress(raw.to_string()))
        }
    }
}

impl TryFrom<String> for BackendAddr {
    type Error = PolicyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<BackendAddr> for String {
    fn from(addr: BackendAddr) -> Self {
        addr.0
    }
}

impl From<std::net::SocketAddr> for BackendAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Candidate selection interface.
///
/// Implementations are shared across every connection of a listener and
/// must tolerate concurrent calls.
pub trait Policy: Send + Sync {
    /// Choose the candidate backends for a call, in order of preference.
    fn choose_candidates(
        &self,
        key: &RoutingKey,
        args: &CallArgs,
    ) -> Result<Vec<BackendAddr>, PolicyError>;

    /// Report an observed dial-to-first-byte latency.
    ///
    /// Best-effort: implementations must not block the caller.
    fn register_latency(&self, _backend: &BackendAddr, _latency: Duration) {}

    /// Short strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Reject an empty backend set.
fn require_backends(backends: &[BackendAddr]) -> Result<(), PolicyError> {
    if backends.is_empty() {
        Err(PolicyError::NoBackends)
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn addrs(raw: &[&str]) -> Vec<BackendAddr> {
    raw.iter().map(|s| s.parse().unwrap()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_addr_parse() {
        assert!("localhost:50052".parse::<BackendAddr>().is_ok());
        assert!("[::1]:8080".parse::<BackendAddr>().is_ok());
        assert!("10.0.0.1:443".parse::<BackendAddr>().is_ok());

        for raw in ["", "localhost", ":8080", "host:", "host:99999", "host:http"] {
            assert_eq!(
                raw.parse::<BackendAddr>(),
                Err(PolicyError::InvalidAddress(raw.to_string()))
            );
        }
    }

    #[test]
    fn test_parse_list() {
        let list = BackendAddr::parse_list(" a:1, b:2 ,,c:3 ").unwrap();
        assert_eq!(list, addrs(&["a:1", "b:2", "c:3"]));
        assert!(BackendAddr::parse_list("a:1,bogus").is_err());
        assert!(BackendAddr::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_backend_addr_serde() {
        let addr: BackendAddr = serde_json::from_str("\"127.0.0.1:9000\"").unwrap();
        assert_eq!(addr.as_str(), "127.0.0.1:9000");
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"127.0.0.1:9000\"");
        assert!(serde_json::from_str::<BackendAddr>("\"nope\"").is_err());
    }
}
