//! Engine configuration.
//!
//! One explicit config struct built at startup and threaded through the
//! constructors. `EngineConfig::default()` is the single defaults object
//! used by tests; nothing in the engine reads process environment variables.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::cache::frame_cache::CachingMode;

/// Fallback fps when a source reports none
pub const DEFAULT_FPS: f32 = 24.0;
/// Fallback image dimensions
pub const DEFAULT_DIM: (u32, u32) = (1920, 1080);
/// fps deltas below this are treated as storage precision loss, not a retime
pub const FPS_EPSILON: f32 = 0.00001;
/// Gap epsilon for the non-linear warp table builder
pub const WARP_EPSILON: f32 = 0.0001;

/// Probe for free system memory, injectable for tests.
///
/// The resource pool's hard floor and the cache budget both need "how much
/// of physical memory is free right now"; production uses sysinfo, tests
/// use [`FixedMemoryProbe`].
pub trait MemoryProbe: Send + Sync {
    /// Fraction of physical memory currently free (0.0-1.0)
    fn free_fraction(&self) -> f32;

    /// Available memory in bytes
    fn available_bytes(&self) -> usize;
}

/// Production probe backed by sysinfo
#[derive(Debug, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn free_fraction(&self) -> f32 {
        let mut sys = System::new_all();
        sys.refresh_memory();
        let total = sys.total_memory().max(1);
        sys.available_memory() as f32 / total as f32
    }

    fn available_bytes(&self) -> usize {
        let mut sys = System::new_all();
        sys.refresh_memory();
        sys.available_memory() as usize
    }
}

/// Test probe reporting a fixed state
#[derive(Debug)]
pub struct FixedMemoryProbe {
    pub free_fraction: f32,
    pub available_bytes: usize,
}

impl MemoryProbe for FixedMemoryProbe {
    fn free_fraction(&self) -> f32 {
        self.free_fraction
    }

    fn available_bytes(&self) -> usize {
        self.available_bytes
    }
}

/// Frame cache sizing and retention policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Initial caching mode
    pub mode: CachingMode,
    /// Explicit byte budget. None = derive from available memory.
    pub max_bytes: Option<usize>,
    /// Fraction of available memory used when max_bytes is None (0.0-1.0)
    pub mem_fraction: f64,
    /// Memory reserved for the rest of the process (GB)
    pub reserve_gb: f64,
    /// Percentage of the retained window trailing the play head (0-100)
    pub look_behind_fraction: f32,
    /// Keep frames outside the in/out region instead of evicting them first
    pub cache_outside_region: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CachingMode::BufferCache,
            max_bytes: None,
            mem_fraction: 0.75,
            reserve_gb: 2.0,
            look_behind_fraction: 25.0,
            cache_outside_region: false,
        }
    }
}

/// Resource pool limits and recycling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Soft byte ceiling; exceeding it triggers a purge of free buffers. 0 = no max.
    pub soft_max_bytes: usize,
    /// Soft buffer-count ceiling. 0 = no max.
    pub soft_max_buffers: usize,
    /// Hard floor: acquire fails rather than allocate when the free memory
    /// fraction would drop below this.
    pub hard_min_free_fraction: f32,
    /// Only recycle buffers of exactly the requested size
    pub recycle_exact_size_only: bool,
    /// When not exact-only, recycle buffers up to size/min_percentage.
    /// 0.0 = any larger buffer qualifies.
    pub recycle_min_percentage: f32,
    /// Largest single buffer the pool will hand out. 0 = no max.
    pub max_item_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            soft_max_bytes: 1024 << 20,
            soft_max_buffers: 0,
            hard_min_free_fraction: 0.10,
            recycle_exact_size_only: false,
            recycle_min_percentage: 0.75,
            max_item_size: 0,
        }
    }
}

/// Fixed-size pool pre-allocation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedPoolConfig {
    /// Per-buffer size ceiling
    pub max_item_size: usize,
    /// Per-buffer size floor; sizing never shrinks a buffer below this
    pub min_item_size: usize,
    /// Buffer count ceiling
    pub max_buffers: usize,
    /// Buffer count floor
    pub min_buffers: usize,
    /// Total pool memory ceiling. 0 = max_item_size * max_buffers.
    pub upper_limit_bytes: usize,
}

impl Default for FixedPoolConfig {
    fn default() -> Self {
        Self {
            max_item_size: 4032 * 4536 * 6,
            min_item_size: 1920 * 1080 * 6,
            max_buffers: 7,
            min_buffers: 3,
            upper_limit_bytes: 0,
        }
    }
}

/// Scheduler thread counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Video evaluation workers. None = 75% of CPU cores, min 1.
    pub eval_threads: Option<usize>,
    /// Frames dispatched per prefetch round
    pub prefetch_group_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            eval_threads: None,
            prefetch_group_size: 8,
        }
    }
}

impl WorkerConfig {
    pub fn resolved_eval_threads(&self) -> usize {
        match self.eval_threads {
            Some(n) => n.max(1),
            None => (num_cpus::get() * 3 / 4).max(1),
        }
    }
}

/// Audio chunk cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Cached audio chunks (each one device buffer worth of samples)
    pub cache_chunks: usize,
    /// Chunks rendered ahead of the last requested window
    pub prime_ahead: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            cache_chunks: 256,
            prime_ahead: 4,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub workers: WorkerConfig,
    pub audio: AudioConfig,
}

impl EngineConfig {
    /// Shared production memory probe
    pub fn system_probe() -> Arc<dyn MemoryProbe> {
        Arc::new(SystemMemoryProbe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_json() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache.look_behind_fraction, 25.0);
        assert_eq!(back.pool.hard_min_free_fraction, 0.10);
    }

    #[test]
    fn test_fixed_probe() {
        let probe = FixedMemoryProbe {
            free_fraction: 0.5,
            available_bytes: 1 << 30,
        };
        assert_eq!(probe.free_fraction(), 0.5);
        assert_eq!(probe.available_bytes(), 1 << 30);
    }
}
