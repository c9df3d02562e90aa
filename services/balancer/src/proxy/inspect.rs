//! Routing-key extraction from gRPC over HTTP/2.
//!
//! The inspector runs a server-side HTTP/2 connection over a
//! [`PeekingConn`] just far enough to receive the HEADERS of the first
//! request, and takes its `:path` as the routing key. The connection
//! preface, SETTINGS and anything else read along the way end up in the
//! captured prefix; the server's own frames are dropped by the adapter.
//! The real handshake happens between the client and the chosen backend.
//!
//! Timeouts and bounds:
//! - inspect_timeout: 2s default
//! - max_peek_bytes: 64 KiB default

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

use super::peek::{PeekingConn, DEFAULT_MAX_PEEK_BYTES};
use crate::call::{CallArgs, RoutingKey};
use crate::error::BalancerError;

/// Default time allowed for the first request to arrive.
pub const DEFAULT_INSPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for routing-key extraction.
#[derive(Debug, Clone)]
pub struct InspectConfig {
    /// Maximum time to wait for the first request HEADERS.
    pub timeout: Duration,
    /// Maximum bytes captured while waiting.
    pub max_bytes: usize,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_INSPECT_TIMEOUT,
            max_bytes: DEFAULT_MAX_PEEK_BYTES,
        }
    }
}

/// Routing inputs of the first call on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedCall {
    pub key: RoutingKey,
    pub args: CallArgs,
}

/// Extracts the routing key of the first call multiplexed on a connection.
#[derive(Debug, Clone, Default)]
pub struct FrameInspector {
    config: InspectConfig,
}

impl FrameInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: InspectConfig) -> Self {
        Self { config }
    }

    /// Wrap an inbound stream in an adapter using this inspector's bound.
    pub fn wrap<S>(&self, stream: S) -> PeekingConn<S> {
        PeekingConn::with_limit(stream, self.config.max_bytes)
    }

    /// Read the first request's HEADERS through the adapter.
    ///
    /// Stops as soon as the headers are decoded; request body bytes that
    /// were read along the way stay in the captured prefix, untouched.
    pub async fn extract_routing_key<S>(
        &self,
        conn: &mut PeekingConn<S>,
    ) -> Result<RoutedCall, BalancerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = timeout(self.config.timeout, first_request(&mut *conn)).await;

        let result = match result {
            Ok(inner) => inner,
            Err(_) => {
                return Err(BalancerError::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "timed out waiting for the first request",
                )))
            }
        };

        match result {
            Ok(call) => {
                debug!(
                    routing_key = %call.key,
                    captured_bytes = conn.captured_len(),
                    "Routing key extracted"
                );
                Ok(call)
            }
            Err(_) if conn.limit_exceeded() => Err(BalancerError::protocol(format!(
                "no request headers within {} bytes",
                self.config.max_bytes
            ))),
            Err(e) => Err(e),
        }
    }
}

async fn first_request<S>(conn: &mut PeekingConn<S>) -> Result<RoutedCall, BalancerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = h2::server::handshake(conn).await.map_err(classify)?;

    let request = match connection.accept().await {
        Some(Ok((request, _respond))) => request,
        Some(Err(e)) => return Err(classify(e)),
        None => {
            return Err(BalancerError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the first request",
            )))
        }
    };

    let key: RoutingKey = request
        .uri()
        .path()
        .parse()
        .map_err(BalancerError::protocol)?;

    let args = CallArgs {
        authority: request.uri().authority().map(|a| a.to_string()),
        metadata: request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
    };

    Ok(RoutedCall { key, args })
}

/// Socket failures are transport errors; everything else the HTTP/2 layer
/// rejects is malformed input.
fn classify(err: h2::Error) -> BalancerError {
    if err.is_io() {
        match err.into_io() {
            Some(io_err) => BalancerError::Transport(io_err),
            None => BalancerError::protocol("HTTP/2 I/O failure"),
        }
    } else {
        BalancerError::protocol(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    /// Minimal client bytes: preface, empty SETTINGS, one HEADERS frame.
    fn request_bytes(path: &str) -> Vec<u8> {
        let mut block = vec![0x83, 0x86, 0x04, path.len() as u8];
        block.extend_from_slice(path.as_bytes());

        let mut out = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec();
        out.extend_from_slice(&[0, 0, 0, 0x04, 0, 0, 0, 0, 0]);
        let len = block.len() as u32;
        out.extend_from_slice(&len.to_be_bytes()[1..]);
        out.extend_from_slice(&[0x01, 0x04, 0, 0, 0, 1]);
        out.extend_from_slice(&block);
        out
    }

    #[tokio::test]
    async fn test_extracts_method_path() {
        let (mut client, server) = duplex(4096);
        let sent = request_bytes("/helloworld.Greeter/SayHello");
        client.write_all(&sent).await.unwrap();

        let inspector = FrameInspector::new();
        let mut conn = inspector.wrap(server);
        let call = inspector.extract_routing_key(&mut conn).await.unwrap();

        assert_eq!(call.key.as_str(), "helloworld.Greeter/SayHello");
        assert_eq!(conn.captured(), sent.as_slice());
    }

    #[tokio::test]
    async fn test_bad_preface_is_protocol_error() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example\r\n\r\n")
            .await
            .unwrap();

        let inspector = FrameInspector::new();
        let mut conn = inspector.wrap(server);
        let err = inspector.extract_routing_key(&mut conn).await.unwrap_err();
        assert_eq!(err.reason_code(), "protocol_error");
    }

    #[tokio::test]
    async fn test_non_method_path_is_protocol_error() {
        let (mut client, server) = duplex(4096);
        client.write_all(&request_bytes("/index.html")).await.unwrap();

        let inspector = FrameInspector::new();
        let mut conn = inspector.wrap(server);
        let err = inspector.extract_routing_key(&mut conn).await.unwrap_err();
        assert!(matches!(err, BalancerError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_closed_before_request_is_transport_error() {
        let (client, server) = duplex(4096);
        drop(client);

        let inspector = FrameInspector::new();
        let mut conn = inspector.wrap(server);
        let err = inspector.extract_routing_key(&mut conn).await.unwrap_err();
        assert!(matches!(err, BalancerError::Transport(_)));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let (_client, server) = duplex(4096);

        let inspector = FrameInspector::with_config(InspectConfig {
            timeout: Duration::from_millis(50),
            ..InspectConfig::default()
        });
        let mut conn = inspector.wrap(server);
        let err = inspector.extract_routing_key(&mut conn).await.unwrap_err();
        match err {
            BalancerError::Transport(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("Expected Transport, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capture_bound() {
        let (mut client, server) = duplex(4096);
        client
            .write_all(&request_bytes("/helloworld.Greeter/SayHello"))
            .await
            .unwrap();

        let inspector = FrameInspector::with_config(InspectConfig {
            max_bytes: 10,
            ..InspectConfig::default()
        });
        let mut conn = inspector.wrap(server);
        let err = inspector.extract_routing_key(&mut conn).await.unwrap_err();
        assert!(matches!(err, BalancerError::Protocol(_)));
    }
}
