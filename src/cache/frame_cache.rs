//! Frame cache: (node, frame, context) -> evaluated image tree.
//!
//! Per-key state machine: Absent -> Building -> Ready -> Evicted. The first
//! thread to query a missing key becomes its builder and gets a
//! [`BuildTicket`]; concurrent queriers block until the entry is ready (or,
//! in prefetch paths, get `Pending` and skip). Dropping an unredeemed
//! ticket releases the claim, so an unwinding builder never wedges its
//! waiters.
//!
//! Every `Ready` checkout increments the entry's reference count and must
//! be balanced by exactly one `check_in`. Entries with a nonzero count are
//! never evicted; a flush moves held entries aside ("zombies") so they stay
//! check-in-able without ever being served again.
//!
//! The lock covers only map bookkeeping. Evaluation happens outside it;
//! builders re-acquire the lock to publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::mem::CacheBudget;
use crate::config::CacheConfig;
use crate::graph::image::Image;
use crate::graph::node::{EvalContext, Eye};

const UTILITY_MAX: f32 = f32::MAX;

/// Process-wide retention policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachingMode {
    /// Results are used once and dropped on final check-in
    NeverCache,
    /// Retain a window around the play head; look-behind fraction decides
    /// how much trails it
    BufferCache,
    /// Retain as much as fits the byte budget, LRU beyond that
    GreedyCache,
}

/// Cache key: node identity + frame + the context bits that change pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub node: Uuid,
    pub frame: i32,
    pub eye: Eye,
    /// Viewport, present only while interactive resize is active
    pub view: Option<(u32, u32)>,
}

impl CacheKey {
    pub fn for_node(node: Uuid, ctx: EvalContext) -> Self {
        Self {
            node,
            frame: ctx.frame,
            eye: ctx.eye,
            view: if ctx.interactive {
                Some((ctx.view_width, ctx.view_height))
            } else {
                None
            },
        }
    }
}

/// Result of a cache query
pub enum Checkout {
    /// Entry is ready and checked out to the caller
    Ready(Arc<Image>),
    /// Caller won the build race and must redeem or drop the ticket
    Build(BuildTicket),
    /// Another thread is building (non-blocking queries only)
    Pending,
}

/// Claim on a Building slot. Redeem with [`FrameCache::complete`]; dropping
/// it unredeemed releases the claim and wakes waiters.
pub struct BuildTicket {
    shared: Arc<CacheShared>,
    key: CacheKey,
    redeemed: bool,
}

impl BuildTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for BuildTicket {
    fn drop(&mut self) {
        if self.redeemed {
            return;
        }
        let mut inner = self.shared.lock();
        if matches!(inner.slots.get(&self.key), Some(Slot::Building)) {
            inner.slots.remove(&self.key);
            inner.doomed.remove(&self.key);
        }
        drop(inner);
        self.shared.ready_cv.notify_all();
    }
}

struct Entry {
    image: Arc<Image>,
    refs: u32,
    stamp: u64,
    bytes: usize,
    /// Dropped on final check-in instead of becoming evictable
    transient: bool,
}

enum Slot {
    Building,
    Ready(Entry),
}

/// A flushed entry still checked out somewhere; only check-in can touch it
struct Zombie {
    key: CacheKey,
    refs: u32,
    bytes: usize,
}

struct Inner {
    slots: HashMap<CacheKey, Slot>,
    zombies: Vec<Zombie>,
    /// Building keys invalidated mid-build; their result lands stale
    doomed: std::collections::HashSet<CacheKey>,
    stamp: u64,
    mode: CachingMode,
    look_behind_fraction: f32,
    cache_outside_region: bool,
    display_frame: i32,
    display_inc: i32,
    in_frame: i32,
    out_frame: i32,
}

struct CacheShared {
    inner: Mutex<Inner>,
    ready_cv: Condvar,
    budget: Arc<CacheBudget>,
}

impl CacheShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cache hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

#[derive(Clone, Copy)]
enum UtilityMode {
    ForCaching,
    ForFreeing,
}

pub struct FrameCache {
    shared: Arc<CacheShared>,
    stats: Arc<CacheStats>,
}

impl FrameCache {
    pub fn new(cfg: &CacheConfig, budget: Arc<CacheBudget>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                inner: Mutex::new(Inner {
                    slots: HashMap::new(),
                    zombies: Vec::new(),
                    doomed: std::collections::HashSet::new(),
                    stamp: 0,
                    mode: cfg.mode,
                    look_behind_fraction: cfg.look_behind_fraction,
                    cache_outside_region: cfg.cache_outside_region,
                    display_frame: i32::MIN,
                    display_inc: 1,
                    in_frame: i32::MIN,
                    out_frame: i32::MAX,
                }),
                ready_cv: Condvar::new(),
                budget,
            }),
            stats: Arc::new(CacheStats::default()),
        }
    }

    // ========== Queries ==========

    /// Query a key, blocking while another thread builds it. Returns
    /// `Ready` (checked out) or `Build` (caller is the builder).
    pub fn checkout_blocking(&self, key: &CacheKey) -> Checkout {
        let mut inner = self.shared.lock();
        loop {
            let building = match inner.slots.get(key) {
                None => {
                    inner.slots.insert(*key, Slot::Building);
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return Checkout::Build(BuildTicket {
                        shared: Arc::clone(&self.shared),
                        key: *key,
                        redeemed: false,
                    });
                }
                Some(Slot::Ready(_)) => false,
                Some(Slot::Building) => true,
            };

            if !building {
                return Checkout::Ready(Self::checkout_ready(&mut inner, &self.stats, key));
            }
            inner = self
                .shared
                .ready_cv
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking query for prefetch paths: `Pending` instead of waiting
    pub fn try_checkout(&self, key: &CacheKey) -> Checkout {
        let mut inner = self.shared.lock();
        let building = match inner.slots.get(key) {
            None => {
                inner.slots.insert(*key, Slot::Building);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Checkout::Build(BuildTicket {
                    shared: Arc::clone(&self.shared),
                    key: *key,
                    redeemed: false,
                });
            }
            Some(Slot::Ready(_)) => false,
            Some(Slot::Building) => true,
        };

        if building {
            Checkout::Pending
        } else {
            Checkout::Ready(Self::checkout_ready(&mut inner, &self.stats, key))
        }
    }

    /// Increment refcount and touch the stamp of a Ready entry
    fn checkout_ready(inner: &mut Inner, stats: &CacheStats, key: &CacheKey) -> Arc<Image> {
        inner.stamp += 1;
        let stamp = inner.stamp;
        let Some(Slot::Ready(entry)) = inner.slots.get_mut(key) else {
            unreachable!("checkout_ready on a non-ready slot")
        };
        entry.refs += 1;
        entry.stamp = stamp;
        stats.hits.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&entry.image)
    }

    /// Publish a built result. The entry is checked out to the builder
    /// (one check-in owed) and all waiters wake.
    pub fn complete(&self, mut ticket: BuildTicket, image: Image) -> Arc<Image> {
        let bytes = image.mem();
        let arc = Arc::new(image);
        let key = ticket.key;
        ticket.redeemed = true;

        let mut inner = self.shared.lock();
        self.evict_for(&mut inner, bytes);

        inner.stamp += 1;
        let stamp = inner.stamp;
        let transient =
            inner.mode == CachingMode::NeverCache || inner.doomed.remove(&key);
        inner.slots.insert(
            key,
            Slot::Ready(Entry {
                image: Arc::clone(&arc),
                refs: 1,
                stamp,
                bytes,
                transient,
            }),
        );
        self.shared.budget.add_memory(bytes);
        drop(inner);
        self.shared.ready_cv.notify_all();
        arc
    }

    /// Balance one checkout. The final check-in makes the entry evictable
    /// (or drops it outright for transient/flushed entries).
    pub fn check_in(&self, key: &CacheKey) {
        let mut inner = self.shared.lock();

        // None = not in slots, Some(drop) = decremented, drop if now unused
        let slot_result: Option<bool> = match inner.slots.get_mut(key) {
            Some(Slot::Ready(entry)) => {
                if entry.refs == 0 {
                    warn!("cache check-in without checkout: {:?}", key);
                    return;
                }
                entry.refs -= 1;
                Some(entry.refs == 0 && entry.transient)
            }
            _ => None,
        };

        match slot_result {
            Some(true) => {
                if let Some(Slot::Ready(entry)) = inner.slots.remove(key) {
                    self.shared.budget.free_memory(entry.bytes);
                }
                return;
            }
            Some(false) => return,
            None => {}
        }

        // Flushed while held: the zombie list is the only remaining record
        if let Some(pos) = inner.zombies.iter().position(|z| z.key == *key) {
            inner.zombies[pos].refs -= 1;
            if inner.zombies[pos].refs == 0 {
                let z = inner.zombies.swap_remove(pos);
                self.shared.budget.free_memory(z.bytes);
            }
            return;
        }

        warn!("cache check-in for unknown key: {:?}", key);
    }

    // ========== Invalidation ==========

    /// Drop every entry for a node (property/topology change). Held
    /// entries become zombies; in-flight builds are doomed to land stale.
    pub fn flush_node(&self, node: Uuid) {
        self.flush_matching(|k| k.node == node);
    }

    pub fn flush_all(&self) {
        self.flush_matching(|_| true);
    }

    fn flush_matching(&self, pred: impl Fn(&CacheKey) -> bool) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let keys: Vec<CacheKey> = inner.slots.keys().filter(|k| pred(k)).copied().collect();

        let mut freed = 0usize;
        for key in keys {
            let is_building = matches!(inner.slots.get(&key), Some(Slot::Building));
            if is_building {
                inner.doomed.insert(key);
                continue;
            }
            if let Some(Slot::Ready(entry)) = inner.slots.remove(&key) {
                if entry.refs == 0 {
                    freed += entry.bytes;
                } else {
                    inner.zombies.push(Zombie {
                        key,
                        refs: entry.refs,
                        bytes: entry.bytes,
                    });
                }
            }
        }
        if freed > 0 {
            self.shared.budget.free_memory(freed);
            debug!("cache flush freed {} bytes", freed);
        }
    }

    // ========== Policy ==========

    pub fn mode(&self) -> CachingMode {
        self.shared.lock().mode
    }

    /// Switch retention policy. Compatible entries survive; NeverCache
    /// drops everything not currently held.
    pub fn set_mode(&self, mode: CachingMode) {
        {
            let mut inner = self.shared.lock();
            if inner.mode == mode {
                return;
            }
            debug!("cache mode: {:?} -> {:?}", inner.mode, mode);
            inner.mode = mode;
        }
        if mode == CachingMode::NeverCache {
            let mut inner = self.shared.lock();
            let keys: Vec<CacheKey> = inner
                .slots
                .iter()
                .filter_map(|(k, s)| match s {
                    Slot::Ready(e) if e.refs == 0 => Some(*k),
                    _ => None,
                })
                .collect();
            let mut freed = 0usize;
            for key in keys {
                if let Some(Slot::Ready(e)) = inner.slots.remove(&key) {
                    freed += e.bytes;
                }
            }
            self.shared.budget.free_memory(freed);
        }
    }

    pub fn set_look_behind_fraction(&self, fraction: f32) {
        self.shared.lock().look_behind_fraction = fraction;
    }

    /// The frame currently on screen; eviction anchors to it
    pub fn set_display_frame(&self, frame: i32, inc: i32) {
        let mut inner = self.shared.lock();
        inner.display_frame = frame;
        if inc != 0 {
            inner.display_inc = inc;
        }
    }

    pub fn display_frame(&self) -> i32 {
        self.shared.lock().display_frame
    }

    /// Playback region; frames outside it are evicted first
    pub fn set_in_out(&self, in_frame: i32, out_frame: i32) {
        let mut inner = self.shared.lock();
        inner.in_frame = in_frame;
        inner.out_frame = out_frame;
    }

    pub fn in_out(&self) -> (i32, i32) {
        let inner = self.shared.lock();
        (inner.in_frame, inner.out_frame)
    }

    // ========== Introspection ==========

    pub fn is_frame_cached(&self, node: Uuid, frame: i32, eye: Eye) -> bool {
        let inner = self.shared.lock();
        inner.slots.iter().any(|(k, s)| {
            matches!(s, Slot::Ready(_)) && k.node == node && k.frame == frame && k.eye == eye
        })
    }

    /// Ready or Building - prefetch skips these keys
    pub fn is_key_active(&self, key: &CacheKey) -> bool {
        self.shared.lock().slots.contains_key(key)
    }

    /// Contiguous cached frame ranges for a node within [lo, hi]
    pub fn cached_ranges(&self, node: Uuid, lo: i32, hi: i32) -> Vec<(i32, i32)> {
        let inner = self.shared.lock();
        let mut frames: Vec<i32> = inner
            .slots
            .iter()
            .filter_map(|(k, s)| match s {
                Slot::Ready(_) if k.node == node && k.frame >= lo && k.frame <= hi => {
                    Some(k.frame)
                }
                _ => None,
            })
            .collect();
        frames.sort_unstable();
        frames.dedup();

        let mut ranges = Vec::new();
        for f in frames {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == f => *end = f,
                _ => ranges.push((f, f)),
            }
        }
        ranges
    }

    pub fn len(&self) -> usize {
        let inner = self.shared.lock();
        inner
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn budget(&self) -> Arc<CacheBudget> {
        Arc::clone(&self.shared.budget)
    }

    /// Caching desirability of a frame (prefetch target selection). 0.0
    /// means "do not cache".
    pub fn utility_for_caching(&self, frame: i32) -> f32 {
        let inner = self.shared.lock();
        Self::utility(&inner, frame, UtilityMode::ForCaching)
    }

    // ========== Internals ==========

    /// Relative importance of a frame. High utility frames are cached,
    /// low utility frames are freed, zero utility frames are never cached.
    fn utility(inner: &Inner, frame: i32, mode: UtilityMode) -> f32 {
        if inner.mode == CachingMode::GreedyCache {
            return if inner.in_frame > frame {
                if inner.cache_outside_region {
                    1.0 / (1.0 + (inner.in_frame - frame) as f32)
                } else {
                    0.0
                }
            } else if inner.out_frame <= frame {
                if inner.cache_outside_region {
                    1.0 / (2.0 + (frame - inner.out_frame) as f32)
                } else {
                    0.0
                }
            } else if frame == inner.in_frame {
                UTILITY_MAX
            } else {
                1.0 + 1.0 / (frame - inner.in_frame).abs() as f32
            };
        }

        // Look-ahead cache
        if frame == inner.display_frame {
            return UTILITY_MAX;
        }

        let first = inner.in_frame;
        let last = inner.out_frame - 1;
        let forward = frame > inner.display_frame;

        let fact = match mode {
            // Caching favors the play direction hard; freeing honors the
            // configured look-behind share
            UtilityMode::ForCaching => 0.001f32,
            UtilityMode::ForFreeing => {
                (inner.look_behind_fraction / 100.0).clamp(0.001, 0.999)
            }
        };

        let mut ffact = fact;
        if (inner.display_inc < 0 && forward) || (inner.display_inc > 0 && !forward) {
            ffact = 1.0 - fact;
        }

        if frame < first {
            return if inner.cache_outside_region {
                1.0 / (1.0 + (first - frame) as f32)
            } else {
                0.0
            };
        }
        if frame > last {
            return if inner.cache_outside_region {
                1.0 / (1.0 + (frame - last) as f32)
            } else {
                0.0
            };
        }

        // If the display frame is outside the region, cache relative to
        // where playback would resume: the in point
        let test = if inner.display_frame < first || inner.display_frame > last {
            first
        } else {
            inner.display_frame
        };

        let mut d = ffact * (frame - test).abs() as f32;

        // Wrap-around distances for looping playback
        let mut round_front = (1 + test - first + last - frame) as f32;
        let mut round_back = (1 + last - test + frame - first) as f32;
        if inner.display_inc < 0 {
            round_front *= fact;
            round_back *= 1.0 - fact;
        } else {
            round_front *= 1.0 - fact;
            round_back *= fact;
        }

        d = d.min(round_front).min(round_back);
        if d <= 0.0 {
            return UTILITY_MAX;
        }
        1.0 + 1.0 / d
    }

    /// Make room for `incoming` bytes. Only refcount-zero Ready entries
    /// are candidates; order is lowest utility first, then oldest stamp.
    fn evict_for(&self, inner: &mut Inner, incoming: usize) {
        loop {
            let (usage, limit) = self.shared.budget.mem();
            if usage + incoming <= limit {
                break;
            }

            let mut victim: Option<(CacheKey, f32, u64)> = None;
            for (key, slot) in inner.slots.iter() {
                let Slot::Ready(entry) = slot else { continue };
                if entry.refs != 0 {
                    continue;
                }
                let u = Self::utility(inner, key.frame, UtilityMode::ForFreeing);
                let better = match &victim {
                    None => true,
                    Some((_, vu, vstamp)) => {
                        u < *vu || (u == *vu && entry.stamp < *vstamp)
                    }
                };
                if better {
                    victim = Some((*key, u, entry.stamp));
                }
            }

            let Some((key, _, _)) = victim else {
                // Everything left is held or building
                break;
            };
            if let Some(Slot::Ready(entry)) = inner.slots.remove(&key) {
                self.shared.budget.free_memory(entry.bytes);
                debug!("evicted frame {} of {} ({} bytes)", key.frame, key.node, entry.bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn test_cache(max_bytes: usize, mode: CachingMode) -> FrameCache {
        let cfg = CacheConfig {
            mode,
            max_bytes: Some(max_bytes),
            ..Default::default()
        };
        let budget = Arc::new(CacheBudget::with_bytes(max_bytes));
        FrameCache::new(&cfg, budget)
    }

    fn key(node: Uuid, frame: i32) -> CacheKey {
        CacheKey {
            node,
            frame,
            eye: Eye::Mono,
            view: None,
        }
    }

    /// A leaf image of roughly `kb` kilobytes
    fn payload_image(node: Uuid, kb: usize) -> Image {
        let payload = crate::media::FramePayload::solid(((kb * 1024) / (4 * 8)) as u32, 8, 1, 0.0);
        Image::leaf(node, Arc::new(payload))
    }

    #[test]
    fn test_build_once_under_contention() {
        let cache = Arc::new(test_cache(64 << 20, CachingMode::GreedyCache));
        let node = Uuid::new_v4();
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            handles.push(thread::spawn(move || {
                let k = key(node, 42);
                match cache.checkout_blocking(&k) {
                    Checkout::Ready(img) => {
                        cache.check_in(&k);
                        img.node
                    }
                    Checkout::Build(ticket) => {
                        builds.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(std::time::Duration::from_millis(10));
                        let arc = cache.complete(ticket, payload_image(node, 4));
                        cache.check_in(&k);
                        arc.node
                    }
                    Checkout::Pending => panic!("blocking checkout returned pending"),
                }
            }));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), node);
        }
        assert_eq!(builds.load(Ordering::Relaxed), 1, "one build per key");
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 7);
    }

    #[test]
    fn test_checkout_checkin_balance() {
        let cache = test_cache(64 << 20, CachingMode::GreedyCache);
        let node = Uuid::new_v4();
        let k = key(node, 1);

        let Checkout::Build(ticket) = cache.checkout_blocking(&k) else {
            panic!("expected build");
        };
        cache.complete(ticket, payload_image(node, 4));

        // Builder + two readers = three outstanding checkouts
        for _ in 0..2 {
            let Checkout::Ready(_) = cache.checkout_blocking(&k) else {
                panic!("expected ready");
            };
        }
        for _ in 0..3 {
            cache.check_in(&k);
        }

        // Balanced: entry must now be evictable under pressure
        let other = Uuid::new_v4();
        let Checkout::Build(t2) = cache.checkout_blocking(&key(other, 1)) else {
            panic!();
        };
        cache.budget().add_memory(63 << 20);
        cache.complete(t2, payload_image(other, 4));
        assert!(!cache.is_frame_cached(node, 1, Eye::Mono));
    }

    #[test]
    fn test_abandoned_ticket_unblocks_waiters() {
        let cache = Arc::new(test_cache(64 << 20, CachingMode::GreedyCache));
        let node = Uuid::new_v4();
        let k = key(node, 7);

        let Checkout::Build(ticket) = cache.checkout_blocking(&k) else {
            panic!();
        };

        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || match cache.checkout_blocking(&k) {
                Checkout::Build(t) => {
                    let arc = cache.complete(t, payload_image(node, 1));
                    cache.check_in(&k);
                    arc.node
                }
                Checkout::Ready(img) => {
                    cache.check_in(&k);
                    img.node
                }
                Checkout::Pending => panic!(),
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        drop(ticket); // builder unwound without a result

        assert_eq!(waiter.join().unwrap(), node);
    }

    #[test]
    fn test_never_cache_drops_on_final_check_in() {
        let cache = test_cache(64 << 20, CachingMode::NeverCache);
        let node = Uuid::new_v4();
        let k = key(node, 1);

        let Checkout::Build(ticket) = cache.checkout_blocking(&k) else {
            panic!();
        };
        cache.complete(ticket, payload_image(node, 4));
        assert!(cache.is_frame_cached(node, 1, Eye::Mono));

        cache.check_in(&k);
        assert!(!cache.is_frame_cached(node, 1, Eye::Mono));
        let (usage, _) = cache.budget().mem();
        assert_eq!(usage, 0);
    }

    #[test]
    fn test_eviction_never_removes_held_entries() {
        // Budget fits ~2 of the 4KB entries
        let cache = test_cache(10 * 1024, CachingMode::GreedyCache);
        cache.set_in_out(0, 1000);
        let node = Uuid::new_v4();

        let held = key(node, 1);
        let Checkout::Build(ticket) = cache.checkout_blocking(&held) else {
            panic!();
        };
        let held_img = cache.complete(ticket, payload_image(node, 4));
        // NOT checked in: refcount stays 1

        for f in 2..10 {
            let k = key(node, f);
            let Checkout::Build(t) = cache.checkout_blocking(&k) else {
                panic!();
            };
            cache.complete(t, payload_image(node, 4));
            cache.check_in(&k);
        }

        // The held entry survived the pressure with its content intact
        assert!(cache.is_frame_cached(node, 1, Eye::Mono));
        let Checkout::Ready(again) = cache.checkout_blocking(&held) else {
            panic!("held entry must stay ready");
        };
        assert!(Arc::ptr_eq(&again, &held_img));
        cache.check_in(&held);
        cache.check_in(&held);
    }

    #[test]
    fn test_buffer_mode_evicts_outside_window_first() {
        let cache = test_cache(10 * 1024, CachingMode::BufferCache);
        cache.set_in_out(10, 20);
        cache.set_display_frame(12, 1);
        let node = Uuid::new_v4();

        // One frame inside the region, one outside
        for f in [12, 50] {
            let k = key(node, f);
            let Checkout::Build(t) = cache.checkout_blocking(&k) else {
                panic!();
            };
            cache.complete(t, payload_image(node, 4));
            cache.check_in(&k);
        }

        // Next insert forces one eviction; the out-of-region frame goes
        let k = key(node, 13);
        let Checkout::Build(t) = cache.checkout_blocking(&k) else {
            panic!();
        };
        cache.complete(t, payload_image(node, 4));
        cache.check_in(&k);

        assert!(cache.is_frame_cached(node, 12, Eye::Mono));
        assert!(cache.is_frame_cached(node, 13, Eye::Mono));
        assert!(!cache.is_frame_cached(node, 50, Eye::Mono));
    }

    #[test]
    fn test_flush_while_held_keeps_check_in_safe() {
        let cache = test_cache(64 << 20, CachingMode::GreedyCache);
        let node = Uuid::new_v4();
        let k = key(node, 1);

        let Checkout::Build(ticket) = cache.checkout_blocking(&k) else {
            panic!();
        };
        cache.complete(ticket, payload_image(node, 4));

        cache.flush_node(node);
        // Flushed: no longer served
        assert!(!cache.is_frame_cached(node, 1, Eye::Mono));
        // But the outstanding checkout still balances cleanly
        cache.check_in(&k);
        let (usage, _) = cache.budget().mem();
        assert_eq!(usage, 0);
    }

    #[test]
    fn test_flush_dooms_in_flight_build() {
        let cache = test_cache(64 << 20, CachingMode::GreedyCache);
        let node = Uuid::new_v4();
        let k = key(node, 1);

        let Checkout::Build(ticket) = cache.checkout_blocking(&k) else {
            panic!();
        };
        cache.flush_node(node);

        // The stale build completes but won't outlive its check-in
        cache.complete(ticket, payload_image(node, 4));
        cache.check_in(&k);
        assert!(!cache.is_frame_cached(node, 1, Eye::Mono));
    }

    #[test]
    fn test_cached_ranges() {
        let cache = test_cache(64 << 20, CachingMode::GreedyCache);
        let node = Uuid::new_v4();
        for f in [1, 2, 3, 7, 8, 20] {
            let k = key(node, f);
            let Checkout::Build(t) = cache.checkout_blocking(&k) else {
                panic!();
            };
            cache.complete(t, payload_image(node, 1));
            cache.check_in(&k);
        }
        assert_eq!(
            cache.cached_ranges(node, 1, 100),
            vec![(1, 3), (7, 8), (20, 20)]
        );
    }

    #[test]
    fn test_mode_switch_keeps_compatible_entries() {
        let cache = test_cache(64 << 20, CachingMode::GreedyCache);
        let node = Uuid::new_v4();
        let k = key(node, 1);
        let Checkout::Build(t) = cache.checkout_blocking(&k) else {
            panic!();
        };
        cache.complete(t, payload_image(node, 4));
        cache.check_in(&k);

        cache.set_mode(CachingMode::BufferCache);
        assert!(cache.is_frame_cached(node, 1, Eye::Mono));

        cache.set_mode(CachingMode::NeverCache);
        assert!(!cache.is_frame_cached(node, 1, Eye::Mono));
    }

    #[test]
    fn test_interactive_view_separates_keys() {
        let node = Uuid::new_v4();
        let mut ctx = EvalContext::for_frame(5);
        let a = CacheKey::for_node(node, ctx);
        ctx.interactive = true;
        ctx.view_width = 640;
        ctx.view_height = 360;
        let b = CacheKey::for_node(node, ctx);
        assert_ne!(a, b);
        assert_eq!(a.view, None);
        assert_eq!(b.view, Some((640, 360)));
    }
}
