//! Resource limiter for parallel group dispatch.
//!
//! A counting semaphore whose size is derived from the declared resource
//! weights of a group's members and the configured budget ceilings: at most
//! `floor(ceiling / heaviest member weight)` members run at once in every
//! dimension, further capped by the configured maximum concurrency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marketflow_types::config::ResourceBudget;
use marketflow_types::workflow::ResourceWeights;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Tolerance for floating point division when sizing the semaphore.
const SIZING_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// No permit became available before the deadline.
    #[error("resource starvation: no permit within {waited_ms}ms")]
    Starved { waited_ms: u64 },

    #[error("resource limiter closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// ResourceLimiter
// ---------------------------------------------------------------------------

/// Bounds how many steps hold a permit at the same time.
///
/// Cloning shares the underlying semaphore and counters.
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ResourceLimiter {
    /// A limiter with exactly `capacity` permits (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A limiter sized for a group of members with the given weights.
    pub fn for_weights(weights: &[ResourceWeights], budget: &ResourceBudget, max_concurrency: usize) -> Self {
        Self::new(Self::concurrency_level(weights, budget, max_concurrency))
    }

    /// Number of members that may run concurrently without any budget
    /// dimension being exceeded.
    pub fn concurrency_level(
        weights: &[ResourceWeights],
        budget: &ResourceBudget,
        max_concurrency: usize,
    ) -> usize {
        fn fit(ceiling: f64, heaviest: f64) -> usize {
            if heaviest <= 0.0 {
                return usize::MAX;
            }
            ((ceiling / heaviest) + SIZING_EPSILON).floor().max(0.0) as usize
        }

        let heaviest = |f: fn(&ResourceWeights) -> f64| {
            weights.iter().map(f).fold(0.0_f64, f64::max)
        };

        let level = fit(budget.cpu_ceiling, heaviest(|w| w.cpu))
            .min(fit(budget.memory_ceiling, heaviest(|w| w.memory)))
            .min(fit(budget.network_ceiling, heaviest(|w| w.network)))
            .min(max_concurrency)
            .min(weights.len().max(1));

        level.max(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits held at once since construction.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait for a permit. Waiters are served in FIFO order.
    pub async fn acquire(&self, weights: ResourceWeights) -> Result<ResourcePermit, LimiterError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;
        Ok(self.track(permit, weights))
    }

    /// Wait for a permit for at most `timeout`.
    pub async fn acquire_timeout(
        &self,
        weights: ResourceWeights,
        timeout: Duration,
    ) -> Result<ResourcePermit, LimiterError> {
        match tokio::time::timeout(timeout, self.acquire(weights)).await {
            Ok(result) => result,
            Err(_) => Err(LimiterError::Starved {
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Return a permit. Dropping the permit has the same effect.
    pub fn release(&self, permit: ResourcePermit) {
        drop(permit);
    }

    fn track(&self, permit: OwnedSemaphorePermit, weights: ResourceWeights) -> ResourcePermit {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ResourcePermit {
            _permit: permit,
            weights,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

/// A held slot in a [`ResourceLimiter`]. Released on drop.
#[derive(Debug)]
pub struct ResourcePermit {
    _permit: OwnedSemaphorePermit,
    weights: ResourceWeights,
    in_flight: Arc<AtomicUsize>,
}

impl ResourcePermit {
    pub fn weights(&self) -> &ResourceWeights {
        &self.weights
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
