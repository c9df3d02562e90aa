//! Error types for the balancer.

use std::io;

use thiserror::Error;

use crate::policy::{BackendAddr, PolicyError};

/// Errors that terminate (or eliminate part of) a proxied call.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Socket-level failure on the client or backend side.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The inbound byte stream does not conform to the expected framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The policy produced no backend for the call.
    #[error("no candidates: {0}")]
    NoCandidates(#[from] PolicyError),

    /// A single candidate could not be dialed.
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: BackendAddr,
        #[source]
        source: io::Error,
    },

    /// Every candidate of the call failed to dial.
    #[error("backend unavailable: all {attempted} candidates failed to dial")]
    BackendUnavailable { attempted: usize },
}

impl BalancerError {
    /// Build a protocol error from anything displayable.
    pub fn protocol(detail: impl std::fmt::Display) -> Self {
        BalancerError::Protocol(detail.to_string())
    }

    /// Stable reason code for logs and stats.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BalancerError::Transport(_) => "transport_error",
            BalancerError::Protocol(_) => "protocol_error",
            BalancerError::NoCandidates(_) => "no_candidates",
            BalancerError::Dial { .. } => "dial_error",
            BalancerError::BackendUnavailable { .. } => "backend_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = BalancerError::protocol("bad preface");
        assert_eq!(err.reason_code(), "protocol_error");
        assert_eq!(err.to_string(), "protocol error: bad preface");

        let err = BalancerError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(err.reason_code(), "transport_error");

        let err = BalancerError::BackendUnavailable { attempted: 3 };
        assert_eq!(
            err.to_string(),
            "backend unavailable: all 3 candidates failed to dial"
        );
    }

    #[test]
    fn test_dial_and_policy_codes() {
        let err = BalancerError::Dial {
            addr: "127.0.0.1:9".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(err.reason_code(), "dial_error");
        assert_eq!(
            BalancerError::NoCandidates(PolicyError::NoBackends).reason_code(),
            "no_candidates"
        );
    }
}
