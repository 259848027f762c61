//! Cache memory budget and epoch counter.
//!
//! One budget is shared by the frame cache and the scheduler: byte usage is
//! tracked atomically across threads, and the epoch counter cancels stale
//! prefetch work when the play head jumps or the graph is edited.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{debug, info};

use crate::config::{CacheConfig, MemoryProbe};

#[derive(Debug)]
pub struct CacheBudget {
    memory_usage: AtomicUsize,
    max_memory_bytes: AtomicUsize,
    current_epoch: Arc<AtomicU64>,
}

impl CacheBudget {
    pub fn new(cfg: &CacheConfig, probe: &dyn MemoryProbe) -> Self {
        let max_memory_bytes = match cfg.max_bytes {
            Some(bytes) => bytes,
            None => {
                let available = probe.available_bytes();
                let reserve = (cfg.reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
                let usable = available.saturating_sub(reserve);
                (usable as f64 * cfg.mem_fraction) as usize
            }
        };

        info!(
            "cache budget: limit={} MB",
            max_memory_bytes / 1024 / 1024
        );

        Self {
            memory_usage: AtomicUsize::new(0),
            max_memory_bytes: AtomicUsize::new(max_memory_bytes),
            current_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fixed-byte budget, for tests
    pub fn with_bytes(max_bytes: usize) -> Self {
        Self {
            memory_usage: AtomicUsize::new(0),
            max_memory_bytes: AtomicUsize::new(max_bytes),
            current_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bump the epoch, cancelling queued prefetch work
    pub fn increment_epoch(&self) -> u64 {
        let new_epoch = self.current_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("epoch incremented: {}", new_epoch);
        new_epoch
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Shared epoch counter (handed to worker pools)
    pub fn epoch_ref(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current_epoch)
    }

    pub fn over_limit(&self) -> bool {
        self.memory_usage.load(Ordering::Relaxed) > self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// (usage, limit) in bytes
    pub fn mem(&self) -> (usize, usize) {
        (
            self.memory_usage.load(Ordering::Relaxed),
            self.max_memory_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn add_memory(&self, bytes: usize) {
        let new_usage = self.memory_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        if new_usage > limit {
            debug!(
                "cache budget exceeded: {} MB / {} MB",
                new_usage / 1024 / 1024,
                limit / 1024 / 1024
            );
        }
    }

    /// Saturating release so racing frees can't underflow
    pub fn free_memory(&self, bytes: usize) {
        loop {
            let current = self.memory_usage.load(Ordering::Relaxed);
            let new_val = current.saturating_sub(bytes);
            if self
                .memory_usage
                .compare_exchange_weak(current, new_val, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn set_limit_bytes(&self, bytes: usize) {
        self.max_memory_bytes.store(bytes, Ordering::Relaxed);
        info!("cache budget updated: {} MB", bytes / 1024 / 1024);
    }
}
