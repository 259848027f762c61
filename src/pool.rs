//! Fenced resource pool for fixed-identity transfer buffers.
//!
//! Hands out recycled buffers without forcing a device sync per frame:
//! every entry carries a fence that is armed on release and must signal
//! before the buffer can be recycled. Free entries are keyed by size;
//! recycling takes the least-recently-used entry of the smallest fitting
//! size, and if that one's fence hasn't signaled no newer entry is tried
//! either.
//!
//! Allocation beyond the soft byte/count maxima purges LRU purgeable free
//! entries; when purging can't get back under, the hard floor applies: if
//! free system memory is below the configured fraction, `acquire` returns
//! None and the caller takes its unpooled path.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::config::{FixedPoolConfig, MemoryProbe, PoolConfig};

/// Synchronization object attached to every pool entry.
///
/// `arm` is called when a buffer is released (its previous consumer may
/// still be reading); `signaled` reports whether that consumer finished.
pub trait PoolFence: Send + Sync {
    fn arm(&self);
    fn signaled(&self) -> bool;
}

/// Host-memory fence: the consumer is done by the time release is called
#[derive(Debug, Default)]
pub struct HostFence;

impl PoolFence for HostFence {
    fn arm(&self) {}

    fn signaled(&self) -> bool {
        true
    }
}

/// Externally driven fence for device backends and tests
#[derive(Debug, Default)]
pub struct ManualFence {
    pending: AtomicBool,
}

impl ManualFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// The prior consumer finished; the buffer may be recycled
    pub fn signal(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

impl PoolFence for ManualFence {
    fn arm(&self) {
        self.pending.store(true, Ordering::Release);
    }

    fn signaled(&self) -> bool {
        !self.pending.load(Ordering::Acquire)
    }
}

/// Anything the pool can recycle
pub trait PoolResource: Send {
    fn byte_size(&self) -> usize;
}

impl PoolResource for Vec<u8> {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl PoolResource for Vec<f32> {
    fn byte_size(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }
}

/// A checked-out buffer. The caller owns the resource until `release`.
pub struct PoolLease<T> {
    pub resource: T,
    pub fence: Arc<dyn PoolFence>,
    id: u64,
    size: usize,
}

impl<T> PoolLease<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

type Allocator<T> = Box<dyn Fn(usize) -> Option<T> + Send + Sync>;
type FenceFactory = Box<dyn Fn() -> Arc<dyn PoolFence> + Send + Sync>;

struct FreeEntry<T> {
    id: u64,
    resource: T,
    fence: Arc<dyn PoolFence>,
    stamp: u64,
    purgeable: bool,
}

struct UsedEntry {
    fence: Arc<dyn PoolFence>,
    size: usize,
    purgeable: bool,
}

struct PoolInner<T> {
    free: BTreeMap<usize, VecDeque<FreeEntry<T>>>,
    used: HashMap<u64, UsedEntry>,
    cur_stamp: u64,
    next_id: u64,
    alloc_bytes: usize,
    alloc_count: usize,
}

pub struct ResourcePool<T: PoolResource> {
    cfg: PoolConfig,
    probe: Arc<dyn MemoryProbe>,
    alloc: Allocator<T>,
    fences: FenceFactory,
    inner: Mutex<PoolInner<T>>,
}

/// Staging buffers for host-to-device upload
pub type StagingPool = ResourcePool<Vec<f32>>;

impl ResourcePool<Vec<f32>> {
    /// Staging pool with plain vector buffers and host fences
    pub fn staging(cfg: PoolConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self::new(
            cfg,
            probe,
            Box::new(|n| Some(vec![0.0f32; n])),
            Box::new(|| Arc::new(HostFence) as Arc<dyn PoolFence>),
        )
    }
}

impl<T: PoolResource> ResourcePool<T> {
    pub fn new(
        cfg: PoolConfig,
        probe: Arc<dyn MemoryProbe>,
        alloc: Allocator<T>,
        fences: FenceFactory,
    ) -> Self {
        Self {
            cfg,
            probe,
            alloc,
            fences,
            inner: Mutex::new(PoolInner {
                free: BTreeMap::new(),
                used: HashMap::new(),
                cur_stamp: 0,
                next_id: 0,
                alloc_bytes: 0,
                alloc_count: 0,
            }),
        }
    }

    /// Fixed-size variant: pre-allocate the whole pool of same-size buffers
    /// up front so first use never stalls on allocation. Buffer size, then
    /// buffer count, are reduced to fit the upper memory limit.
    pub fn fixed_size(
        mut cfg: PoolConfig,
        fixed: &FixedPoolConfig,
        probe: Arc<dyn MemoryProbe>,
        alloc: Allocator<T>,
        fences: FenceFactory,
    ) -> Self {
        // Slightly more buffers than the prefetcher can use, to cover
        // buffers held for processing
        const EXTRA: f32 = 1.05;

        let min_count = ((fixed.min_buffers as f32) * EXTRA).ceil() as usize;
        let pool_min_bytes = fixed.min_item_size * min_count;

        let mut item_size = fixed.max_item_size;
        let mut count = ((fixed.max_buffers as f32) * EXTRA).ceil() as usize;
        let mut pool_bytes = item_size * count;

        let upper = if fixed.upper_limit_bytes != 0 {
            fixed.upper_limit_bytes
        } else {
            pool_bytes
        };

        if pool_min_bytes > upper {
            // Even the minimum fixed pool doesn't fit; run variable-size
            debug!(
                "fixed pool minimum {} exceeds limit {}, using variable pool",
                pool_min_bytes, upper
            );
            cfg.soft_max_bytes = upper;
            return Self::new(cfg, probe, alloc, fences);
        }

        if pool_bytes > upper {
            // Shrink the buffers first, the count second
            pool_bytes = upper;
            item_size = pool_bytes / count;
            if fixed.min_item_size > item_size {
                count = pool_bytes / fixed.min_item_size;
                item_size = pool_bytes / count;
            }
        }

        // The hard floor applies only after pre-allocation so the warm-up
        // itself can't be refused
        let hard_floor = cfg.hard_min_free_fraction;
        cfg.hard_min_free_fraction = 0.0;
        cfg.soft_max_buffers = count;
        cfg.soft_max_bytes = 0;
        cfg.recycle_exact_size_only = false;
        cfg.recycle_min_percentage = 0.0;
        cfg.max_item_size = item_size;

        let pool = Self::new(cfg, probe, alloc, fences);
        let mut leases = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(lease) = pool.acquire_with(item_size, false) {
                leases.push(lease);
            }
        }
        debug!(
            "fixed pool warmed: {} buffers of {} bytes",
            leases.len(),
            item_size
        );
        for lease in leases {
            pool.release(lease);
        }

        let mut pool = pool;
        pool.cfg.hard_min_free_fraction = hard_floor;
        pool
    }

    /// Recycle-or-allocate a buffer of `size`. None when the size exceeds
    /// the per-item cap or the hard memory floor would be violated.
    pub fn acquire(&self, size: usize) -> Option<PoolLease<T>> {
        self.acquire_with(size, true)
    }

    fn acquire_with(&self, size: usize, purgeable: bool) -> Option<PoolLease<T>> {
        if self.cfg.max_item_size != 0 && size > self.cfg.max_item_size {
            return None;
        }

        if let Some(lease) = self.recycle(size) {
            // Recycling may still leave the pool over a soft maximum if
            // the limits were lowered; trim opportunistically
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let inner = &mut *guard;
            if self.cfg.soft_max_bytes > 0 && inner.alloc_bytes > self.cfg.soft_max_bytes {
                let need = inner.alloc_bytes - self.cfg.soft_max_bytes;
                Self::purge_locked(inner, need, 0);
            }
            if self.cfg.soft_max_buffers > 0 && inner.alloc_count > self.cfg.soft_max_buffers {
                let need = inner.alloc_count - self.cfg.soft_max_buffers;
                Self::purge_locked(inner, 0, need);
            }
            return Some(lease);
        }

        // Allocate new; purge toward the soft maxima first
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;

        let mut over_soft = false;
        if self.cfg.soft_max_bytes > 0 && inner.alloc_bytes + size > self.cfg.soft_max_bytes {
            let need = inner.alloc_bytes + size - self.cfg.soft_max_bytes;
            over_soft |= !Self::purge_locked(inner, need, 0);
        }
        if self.cfg.soft_max_buffers > 0 && inner.alloc_count + 1 > self.cfg.soft_max_buffers {
            let need = inner.alloc_count + 1 - self.cfg.soft_max_buffers;
            over_soft |= !Self::purge_locked(inner, 0, need);
        }

        if over_soft {
            // Going past the soft limits is allowed until the hard floor
            let free = self.probe.free_fraction();
            if free < self.cfg.hard_min_free_fraction {
                debug!(
                    "pool acquire({}) refused: free memory {:.2} below floor {:.2}",
                    size, free, self.cfg.hard_min_free_fraction
                );
                return None;
            }
        }

        let resource = (self.alloc)(size)?;
        let fence = (self.fences)();
        inner.cur_stamp += 1;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.used.insert(
            id,
            UsedEntry {
                fence: Arc::clone(&fence),
                size,
                purgeable,
            },
        );
        inner.alloc_bytes += size;
        inner.alloc_count += 1;

        Some(PoolLease {
            resource,
            fence,
            id,
            size,
        })
    }

    /// Return a buffer; its fence is armed and it joins the free bucket
    /// for its size. Not recyclable until the fence signals.
    pub fn release(&self, lease: PoolLease<T>) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;

        let Some(used) = inner.used.remove(&lease.id) else {
            debug!("pool release of unknown lease {}", lease.id);
            return;
        };

        used.fence.arm();
        inner.cur_stamp += 1;
        let entry = FreeEntry {
            id: lease.id,
            resource: lease.resource,
            fence: used.fence,
            stamp: inner.cur_stamp,
            purgeable: used.purgeable,
        };
        inner.free.entry(used.size).or_default().push_back(entry);
    }

    fn recycle(&self, size: usize) -> Option<PoolLease<T>> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;

        let max_size = if self.cfg.recycle_exact_size_only {
            size
        } else if self.cfg.recycle_min_percentage == 0.0 {
            usize::MAX
        } else {
            (size as f32 / self.cfg.recycle_min_percentage) as usize
        };

        let bucket = inner
            .free
            .range(size..)
            .next()
            .map(|(k, _)| *k)
            .filter(|k| *k <= max_size)?;

        let queue = inner.free.get_mut(&bucket)?;
        // The LRU front is the recycling candidate; if its fence hasn't
        // been reached, no younger buffer's has either
        if !queue.front()?.fence.signaled() {
            return None;
        }
        let entry = queue.pop_front()?;
        if queue.is_empty() {
            inner.free.remove(&bucket);
        }

        inner.cur_stamp += 1;
        inner.used.insert(
            entry.id,
            UsedEntry {
                fence: Arc::clone(&entry.fence),
                size: bucket,
                purgeable: entry.purgeable,
            },
        );

        Some(PoolLease {
            resource: entry.resource,
            fence: entry.fence,
            id: entry.id,
            size: bucket,
        })
    }

    /// Destroy LRU purgeable free entries until `min_bytes`/`min_count`
    /// are reclaimed. True when both targets were met.
    fn purge_locked(inner: &mut PoolInner<T>, min_bytes: usize, min_count: usize) -> bool {
        let mut purged_bytes = 0usize;
        let mut purged_count = 0usize;

        while !inner.free.is_empty()
            && (min_bytes == 0 || purged_bytes < min_bytes)
            && (min_count == 0 || purged_count < min_count)
        {
            // Oldest purgeable entry across all size buckets
            let mut victim: Option<(usize, usize, u64)> = None;
            for (bucket, queue) in inner.free.iter() {
                for (idx, entry) in queue.iter().enumerate() {
                    if entry.purgeable && victim.map(|(_, _, s)| entry.stamp < s).unwrap_or(true)
                    {
                        victim = Some((*bucket, idx, entry.stamp));
                    }
                    if entry.purgeable {
                        break;
                    }
                }
            }

            let Some((bucket, idx, _)) = victim else {
                break;
            };
            if let Some(queue) = inner.free.get_mut(&bucket) {
                queue.remove(idx);
                if queue.is_empty() {
                    inner.free.remove(&bucket);
                }
            }
            purged_bytes += bucket;
            purged_count += 1;
            inner.alloc_bytes = inner.alloc_bytes.saturating_sub(bucket);
            inner.alloc_count = inner.alloc_count.saturating_sub(1);
            debug!("pool purged {} bytes (stamp order)", bucket);
        }

        (min_bytes == 0 || purged_bytes >= min_bytes)
            && (min_count == 0 || purged_count >= min_count)
    }

    /// (allocated bytes, allocated buffer count)
    pub fn allocated(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.alloc_bytes, inner.alloc_count)
    }

    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.free.values().map(|q| q.len()).sum()
    }

    pub fn used_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.used.len()
    }

    pub fn max_item_size(&self) -> usize {
        self.cfg.max_item_size
    }
}
