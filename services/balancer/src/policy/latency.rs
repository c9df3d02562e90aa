//! Latency feedback.
//!
//! Sessions report the time from dial start to the first response byte.
//! The table keeps an exponentially weighted moving average per backend and
//! is shared between every call of a listener.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use tracing::trace;

use crate::call::{CallArgs, RoutingKey};

use super::{require_backends, BackendAddr, Policy, PolicyError};

/// Default smoothing factor for the moving average.
pub const DEFAULT_EWMA_ALPHA: f64 = 0.3;

/// Observed latency for one backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    /// Smoothed latency.
    pub ewma: Duration,
    /// Most recent sample.
    pub last: Duration,
    /// Number of samples recorded.
    pub samples: u64,
}

/// Process-lifetime latency feedback table.
#[derive(Debug)]
pub struct LatencyTable {
    entries: Mutex<HashMap<BackendAddr, LatencyStats>>,
    alpha: f64,
}

impl LatencyTable {
    pub fn new() -> Self {
        Self::with_alpha(DEFAULT_EWMA_ALPHA)
    }

    /// Create a table with a custom smoothing factor in `(0, 1]`.
    ///
    /// Out-of-range factors are clamped; NaN and infinities fall back to
    /// the default.
    pub fn with_alpha(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(f64::EPSILON, 1.0)
        } else {
            DEFAULT_EWMA_ALPHA
        };
        Self {
            entries: Mutex::new(HashMap::new()),
            alpha,
        }
    }

    /// Record a sample.
    ///
    /// Never waits for the lock: under contention the sample is dropped and
    /// `false` is returned.
    pub fn record(&self, backend: &BackendAddr, latency: Duration) -> bool {
        let mut entries = match self.entries.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                trace!(backend = %backend, "Latency sample dropped under contention");
                return false;
            }
        };

        let alpha = self.alpha;
        entries
            .entry(backend.clone())
            .and_modify(|stats| {
                let smoothed =
                    alpha * latency.as_secs_f64() + (1.0 - alpha) * stats.ewma.as_secs_f64();
                stats.ewma = Duration::from_secs_f64(smoothed);
                stats.last = latency;
                stats.samples += 1;
            })
            .or_insert(LatencyStats {
                ewma: latency,
                last: latency,
                samples: 1,
            });
        true
    }

    /// Stats for one backend, if it has been measured.
    pub fn get(&self, backend: &BackendAddr) -> Option<LatencyStats> {
        self.lock().get(backend).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Order backends fastest first.
    ///
    /// Unmeasured backends come before measured ones so each gets probed;
    /// ties keep the input order.
    pub fn rank(&self, backends: &[BackendAddr]) -> Vec<BackendAddr> {
        let mut keyed: Vec<(Option<Duration>, BackendAddr)> = {
            let entries = self.lock();
            backends
                .iter()
                .map(|b| (entries.get(b).map(|s| s.ewma), b.clone()))
                .collect()
        };
        keyed.sort_by_key(|(ewma, _)| match ewma {
            None => (false, Duration::ZERO),
            Some(d) => (true, *d),
        });
        keyed.into_iter().map(|(_, b)| b).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BackendAddr, LatencyStats>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for LatencyTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the N configured backends with the lowest observed latency.
#[derive(Debug, Clone)]
pub struct LatencyRanked {
    backends: Vec<BackendAddr>,
    width: usize,
    table: Arc<LatencyTable>,
}

impl LatencyRanked {
    pub fn new(backends: Vec<BackendAddr>, width: usize) -> Self {
        Self::with_table(backends, width, Arc::new(LatencyTable::new()))
    }

    /// Share an existing feedback table.
    pub fn with_table(backends: Vec<BackendAddr>, width: usize, table: Arc<LatencyTable>) -> Self {
        Self {
            backends,
            width: width.max(1),
            table,
        }
    }

    pub fn table(&self) -> &Arc<LatencyTable> {
        &self.table
    }
}

impl Policy for LatencyRanked {
    fn choose_candidates(
        &self,
        _key: &RoutingKey,
        _args: &CallArgs,
    ) -> Result<Vec<BackendAddr>, PolicyError> {
        require_backends(&self.backends)?;
        let mut ranked = self.table.rank(&self.backends);
        ranked.truncate(self.width);
        Ok(ranked)
    }

    fn register_latency(&self, backend: &BackendAddr, latency: Duration) {
        self.table.record(backend, latency);
    }

    fn name(&self) -> &'static str {
        "fastest"
    }
}
