use crate::call::{CallArgs, RoutingKey};

use super::{require_backends, BackendAddr, Policy, PolicyError};

/// Always returns the same first N configured backends.
///
/// Degenerate strategy used for deterministic replication. The routing key
/// is ignored.
#[derive(Debug, Clone)]
pub struct FixedN {
    backends: Vec<BackendAddr>,
    n: usize,
}

impl FixedN {
    /// Create a strategy returning the first `n` backends (at least one).
    pub fn new(backends: Vec<BackendAddr>, n: usize) -> Self {
        Self {
            backends,
            n: n.max(1),
        }
    }

    /// The classic "first two" replication setup.
    pub fn first_two(backends: Vec<BackendAddr>) -> Self {
        Self::new(backends, 2)
    }
}

impl Policy for FixedN {
    fn choose_candidates(
        &self,
        _key: &RoutingKey,
        _args: &CallArgs,
    ) -> Result<Vec<BackendAddr>, PolicyError> {
        require_backends(&self.backends)?;
        Ok(self.backends.iter().take(self.n).cloned().collect())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[cfg(test)]
mod tests {
    use super::super::addrs;
    use super::*;

    fn key() -> RoutingKey {
        "/helloworld.Greeter/SayHello".parse().unwrap()
    }

    #[test]
    fn test_first_two_is_stable() {
        let policy = FixedN::first_two(addrs(&["a:1", "b:2", "c:3"]));
        for _ in 0..5 {
            let chosen = policy.choose_candidates(&key(), &CallArgs::new()).unwrap();
            assert_eq!(chosen, addrs(&["a:1", "b:2"]));
        }
    }

    #[test]
    fn test_fewer_backends_than_n() {
        let policy = FixedN::new(addrs(&["a:1"]), 3);
        let chosen = policy.choose_candidates(&key(), &CallArgs::new()).unwrap();
        assert_eq!(chosen, addrs(&["a:1"]));
    }

    #[test]
    fn test_empty_set_has_no_candidates() {
        let policy = FixedN::new(Vec::new(), 2);
        assert_eq!(
            policy.choose_candidates(&key(), &CallArgs::new()),
            Err(PolicyError::NoBackends)
        );
    }
}
