use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::call::{CallArgs, RoutingKey};

use super::{require_backends, BackendAddr, Policy, PolicyError};

/// Picks exactly one backend uniformly at random.
///
/// Used when racing is not wanted. Each instance owns its random source,
/// seeded once at construction.
#[derive(Debug)]
pub struct RandomPick {
    backends: Vec<BackendAddr>,
    rng: Mutex<StdRng>,
}

impl RandomPick {
    /// Create a strategy seeded from the operating system.
    pub fn new(backends: Vec<BackendAddr>) -> Self {
        Self {
            backends,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Create a strategy with a fixed seed (deterministic sequence).
    pub fn with_seed(backends: Vec<BackendAddr>, seed: u64) -> Self {
        Self {
            backends,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Policy for RandomPick {
    fn choose_candidates(
        &self,
        _key: &RoutingKey,
        _args: &CallArgs,
    ) -> Result<Vec<BackendAddr>, PolicyError> {
        require_backends(&self.backends)?;
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(0..self.backends.len());
        Ok(vec![self.backends[index].clone()])
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::super::addrs;
    use super::*;

    fn key() -> RoutingKey {
        "/helloworld.Greeter/SayHello".parse().unwrap()
    }

    #[test]
    fn test_picks_exactly_one_configured_backend() {
        let backends = addrs(&["a:1", "b:2", "c:3"]);
        let policy = RandomPick::new(backends.clone());
        for _ in 0..50 {
            let chosen = policy.choose_candidates(&key(), &CallArgs::new()).unwrap();
            assert_eq!(chosen.len(), 1);
            assert!(backends.contains(&chosen[0]));
        }
    }

    #[test]
    fn test_seeded_instances_agree() {
        let backends = addrs(&["a:1", "b:2", "c:3", "d:4"]);
        let first = RandomPick::with_seed(backends.clone(), 42);
        let second = RandomPick::with_seed(backends, 42);
        for _ in 0..20 {
            assert_eq!(
                first.choose_candidates(&key(), &CallArgs::new()).unwrap(),
                second.choose_candidates(&key(), &CallArgs::new()).unwrap()
            );
        }
    }

    #[test]
    fn test_covers_the_backend_set() {
        let policy = RandomPick::with_seed(addrs(&["a:1", "b:2", "c:3"]), 7);
        let seen: HashSet<_> = (0..200)
            .map(|_| policy.choose_candidates(&key(), &CallArgs::new()).unwrap()[0].clone())
            .collect();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_empty_set_has_no_candidates() {
        let policy = RandomPick::new(Vec::new());
        assert_eq!(
            policy.choose_candidates(&key(), &CallArgs::new()),
            Err(PolicyError::NoBackends)
        );
    }
}
