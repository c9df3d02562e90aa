//! Per-call routing inputs extracted from the inbound stream.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A path that does not name a `service/method` pair.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid method path '{0}': expected /<service>/<method>")]
pub struct InvalidRoutingKey(pub String);

/// Identifier of the operation a call invokes (`package.Service/Method`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    name: String,
    split: usize,
}

impl RoutingKey {
    /// The key without a leading slash, e.g. `helloworld.Greeter/SayHello`.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The service part, e.g. `helloworld.Greeter`.
    pub fn service(&self) -> &str {
        &self.name[..self.split]
    }

    /// The method part, e.g. `SayHello`.
    pub fn method(&self) -> &str {
        &self.name[self.split + 1..]
    }

    /// The request path as it appears on the wire.
    pub fn path(&self) -> String {
        format!("/{}", self.name)
    }
}

impl FromStr for RoutingKey {
    type Err = InvalidRoutingKey;

    /// Accepts `/service/method` as well as `service/method`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let name = raw.strip_prefix('/').unwrap_or(raw);
        match name.split_once('/') {
            Some((service, method))
                if !service.is_empty() && !method.is_empty() && !method.contains('/') =>
            {
                Ok(Self {
                    name: name.to_string(),
                    split: service.len(),
                })
            }
            _ => Err(InvalidRoutingKey(raw.to_string())),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Request metadata visible to the policy.
///
/// Carries the request authority and its non-pseudo headers. Payload bytes
/// are never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    /// The `:authority` of the request, if any.
    pub authority: Option<String>,
    /// Header name/value pairs in arrival order.
    pub metadata: Vec<(String, String)>,
}

impl CallArgs {
    /// Empty call arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((name.into(), value.into()));
        self
    }

    /// First value for a header name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.authority.is_none() && self.metadata.is_empty()
    }
}
