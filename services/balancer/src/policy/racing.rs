use crate::call::{CallArgs, RoutingKey};

use super::{require_backends, BackendAddr, Policy, PolicyError};

/// Returns the first N configured backends (or all of them) so the
/// coordinator races them against each other.
#[derive(Debug, Clone)]
pub struct RacingN {
    backends: Vec<BackendAddr>,
    width: Option<usize>,
}

impl RacingN {
    /// Race the first `width` backends. A width of zero races all of them.
    pub fn new(backends: Vec<BackendAddr>, width: usize) -> Self {
        Self {
            backends,
            width: (width > 0).then_some(width),
        }
    }

    /// Race every configured backend.
    pub fn all(backends: Vec<BackendAddr>) -> Self {
        Self {
            backends,
            width: None,
        }
    }
}

impl Policy for RacingN {
    fn choose_candidates(
        &self,
        _key: &RoutingKey,
        _args: &CallArgs,
    ) -> Result<Vec<BackendAddr>, PolicyError> {
        require_backends(&self.backends)?;
        let width = self.width.unwrap_or(self.backends.len());
        Ok(self.backends.iter().take(width).cloned().collect())
    }

    fn name(&self) -> &'static str {
        "racing"
    }
}
