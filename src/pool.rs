//! Bounded worker pools.
//!
//! One pool instance exists per concurrency dimension: a job-wide pool for
//! phases and one pool per per-item phase for its items. A pool is a
//! semaphore plus in-flight accounting so limits can be observed in tests.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct PoolStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicUsize,
}

/// A named, bounded pool of concurrent slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    size: usize,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Create a pool with `size` slots. A size of zero is raised to one.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name: name.into(),
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<PoolPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .with_context(|| format!("worker pool '{}' closed", self.name))?;

        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);

        Ok(PoolPermit {
            _permit: permit,
            stats: self.stats.clone(),
        })
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots held at once.
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    /// Total permits handed out over the pool's lifetime.
    pub fn total_acquired(&self) -> usize {
        self.stats.acquired.load(Ordering::SeqCst)
    }
}

/// A held slot in a [`WorkerPool`].
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
