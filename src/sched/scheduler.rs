//! Scheduler - coordinates evaluation workers, the audio thread and graph
//! edits against one shared graph + cache.
//!
//! Video evaluation is shared-read: any number of workers walk the graph
//! concurrently under the read lock. A graph-edit bracket takes the write
//! lock, so entering it blocks until in-flight evaluations drain, and
//! leaving it applies the accumulated flushes (frame cache, audio cache)
//! and bumps the epoch so queued prefetch work cancels itself.
//!
//! There is no mid-evaluation cancellation: a stale build completes and
//! publishes under its old key; new requesters key on the new state and
//! never see it.

use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use log::debug;
use lru::LruCache;
use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext};
use crate::cache::frame_cache::{CacheKey, Checkout, FrameCache};
use crate::cache::mem::CacheBudget;
use crate::config::{DEFAULT_FPS, EngineConfig, MemoryProbe};
use crate::error::EvalError;
use crate::events::GraphEvent;
use crate::graph::graph::Graph;
use crate::graph::image::Image;
use crate::graph::node::{EvalContext, FlushClass, Node, ThreadKind};
use crate::graph::node_kind::NodeKind;
use crate::pool::StagingPool;
use crate::sched::work_items::{WorkItemId, WorkItemQueue};
use crate::sched::workers::EvalWorkers;

/// A checked-out evaluation result. Must be passed back through
/// [`Scheduler::check_in_image`] exactly once.
pub struct CheckedOutImage {
    pub key: CacheKey,
    pub image: Arc<Image>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AudioChunkKey {
    start_sample: i64,
    len: usize,
    channels: u16,
    rate: u32,
    generation: u64,
}

struct AudioMix {
    cache: Mutex<LruCache<AudioChunkKey, Arc<Vec<f32>>>>,
    generation: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct PrimeRequest {
    start_sample: i64,
    len: usize,
    channels: u16,
    rate: u32,
    fps: f32,
}

pub struct Scheduler {
    graph: Arc<RwLock<Graph>>,
    cache: Arc<FrameCache>,
    budget: Arc<CacheBudget>,
    pool: Arc<StagingPool>,
    workers: EvalWorkers,
    work_items: WorkItemQueue,
    audio: Arc<AudioMix>,
    prime_tx: Option<crossbeam_channel::Sender<PrimeRequest>>,
    view_node: Arc<Mutex<Option<Uuid>>>,
    last_display_frame: Mutex<i32>,
    display_fps: Mutex<f32>,
    prefetch_group: usize,
    pending_events: Mutex<Vec<GraphEvent>>,
    audio_thread: Option<std::thread::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(cfg: &EngineConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let budget = Arc::new(CacheBudget::new(&cfg.cache, probe.as_ref()));
        let cache = Arc::new(FrameCache::new(&cfg.cache, Arc::clone(&budget)));
        let pool = Arc::new(StagingPool::staging(cfg.pool.clone(), probe));
        let graph = Arc::new(RwLock::new(Graph::new()));
        let workers = EvalWorkers::new(cfg.workers.resolved_eval_threads(), budget.epoch_ref());
        let view_node = Arc::new(Mutex::new(None));

        let (prime_tx, prime_rx) = crossbeam_channel::unbounded::<PrimeRequest>();
        let audio = Arc::new(AudioMix {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cfg.audio.cache_chunks.max(1)).unwrap(),
            )),
            generation: AtomicU64::new(0),
        });

        // The one audio evaluation thread: renders chunks ahead of the
        // last requested window so the device callback stays hit-only
        let audio_thread = {
            let graph = Arc::clone(&graph);
            let audio = Arc::clone(&audio);
            let view_node = Arc::clone(&view_node);
            let prime_ahead = cfg.audio.prime_ahead;
            std::thread::Builder::new()
                .name("rushes-audio".to_string())
                .spawn(move || {
                    while let Ok(req) = prime_rx.recv() {
                        let Some(view) = *view_node.lock().unwrap_or_else(|e| e.into_inner())
                        else {
                            continue;
                        };
                        let generation = audio.generation.load(Ordering::Relaxed);
                        for i in 1..=prime_ahead as i64 {
                            let start = req.start_sample + i * req.len as i64;
                            let key = AudioChunkKey {
                                start_sample: start,
                                len: req.len,
                                channels: req.channels,
                                rate: req.rate,
                                generation,
                            };
                            {
                                let mut cache =
                                    audio.cache.lock().unwrap_or_else(|e| e.into_inner());
                                if cache.contains(&key) {
                                    continue;
                                }
                            }
                            let mut buf =
                                AudioBuffer::new(req.len, req.channels, req.rate, start);
                            {
                                let graph = graph.read().unwrap_or_else(|e| e.into_inner());
                                graph.audio_fill(view, &mut buf, AudioContext { fps: req.fps });
                            }
                            // A flush while rendering makes this chunk stale
                            if audio.generation.load(Ordering::Relaxed) != generation {
                                break;
                            }
                            let mut cache =
                                audio.cache.lock().unwrap_or_else(|e| e.into_inner());
                            cache.put(key, Arc::new(buf.data().to_vec()));
                        }
                    }
                })
                .expect("failed to spawn audio thread")
        };

        Self {
            graph,
            cache,
            budget,
            pool,
            workers,
            work_items: WorkItemQueue::new(),
            audio,
            prime_tx: Some(prime_tx),
            view_node,
            last_display_frame: Mutex::new(i32::MIN),
            display_fps: Mutex::new(0.0),
            prefetch_group: cfg.workers.prefetch_group_size.max(1),
            pending_events: Mutex::new(Vec::new()),
            audio_thread: Some(audio_thread),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&EngineConfig::default(), EngineConfig::system_probe())
    }

    // ========== Graph access ==========

    pub fn graph(&self) -> Arc<RwLock<Graph>> {
        Arc::clone(&self.graph)
    }

    pub fn cache(&self) -> Arc<FrameCache> {
        Arc::clone(&self.cache)
    }

    pub fn budget(&self) -> Arc<CacheBudget> {
        Arc::clone(&self.budget)
    }

    pub fn pool(&self) -> Arc<StagingPool> {
        Arc::clone(&self.pool)
    }

    /// Node evaluated by `evaluate_at_frame` and the audio path
    pub fn set_view_node(&self, id: Uuid) {
        *self.view_node.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    pub fn view_node(&self) -> Option<Uuid> {
        *self.view_node.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_display_fps(&self, fps: f32) {
        *self.display_fps.lock().unwrap_or_else(|e| e.into_inner()) = fps;
    }

    /// Playback region used by retention and prefetch
    pub fn set_in_out(&self, in_frame: i32, out_frame: i32) {
        self.cache.set_in_out(in_frame, out_frame);
    }

    fn context_for_frame(&self, frame: i32, thread: ThreadKind, graph: &Graph) -> EvalContext {
        let mut ctx = EvalContext::for_frame(frame);
        ctx.thread = thread;
        let fps = *self.display_fps.lock().unwrap_or_else(|e| e.into_inner());
        ctx.fps = if fps > 0.0 {
            fps
        } else {
            self.view_node()
                .and_then(|v| graph.node(v))
                .map(|n| n.range_info(graph).fps)
                .filter(|f| *f > 0.0)
                .unwrap_or(DEFAULT_FPS)
        };
        ctx
    }

    // ========== Evaluation ==========

    /// Evaluate the view node at `frame`. Synchronous: blocks on another
    /// thread's in-flight build of the same key, otherwise builds inline.
    /// The result is checked out; balance it with `check_in_image`.
    ///
    /// `for_display` updates the cache's display-frame anchor, so prefetch
    /// callers must pass false.
    pub fn evaluate_at_frame(
        &self,
        frame: i32,
        for_display: bool,
    ) -> Result<CheckedOutImage, EvalError> {
        let view = self.view_node().ok_or(EvalError::NoViewNode)?;
        let graph = self.graph.read().unwrap_or_else(|e| e.into_inner());
        let ctx = self.context_for_frame(frame, ThreadKind::Display, &graph);

        if for_display {
            self.update_display_frame(frame);
        }

        let key = CacheKey::for_node(view, ctx);
        match self.cache.checkout_blocking(&key) {
            Checkout::Ready(image) => Ok(CheckedOutImage { key, image }),
            Checkout::Build(ticket) => {
                let image =
                    graph.evaluate_cached(view, &self.cache, Some(&self.pool), ctx)?;
                let image = self.cache.complete(ticket, image);
                Ok(CheckedOutImage { key, image })
            }
            Checkout::Pending => Err(EvalError::BuildAbandoned { node: view, frame }),
        }
    }

    /// Balance one `evaluate_at_frame` checkout.
    pub fn check_in_image(&self, image: CheckedOutImage, update_display_frame: bool, frame: i32) {
        self.cache.check_in(&image.key);
        if update_display_frame {
            self.update_display_frame(frame);
        }
    }

    fn update_display_frame(&self, frame: i32) {
        let mut last = self
            .last_display_frame
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let inc = if *last == i32::MIN {
            1
        } else {
            (frame - *last).signum()
        };
        *last = frame;
        self.cache.set_display_frame(frame, inc);
    }

    /// Kick background prefetch. Call right after presenting a frame
    /// (after the swap), when a context switch costs the least.
    pub fn post_evaluation(&self) {
        let Some(view) = self.view_node() else {
            return;
        };
        let (in_frame, out_frame) = self.cache.in_out();
        if in_frame == i32::MIN || out_frame == i32::MAX {
            return;
        }
        let display = self.cache.display_frame();
        let center = display.clamp(in_frame, out_frame);
        let epoch = self.budget.current_epoch();

        // Spiral outward from the display frame, skipping cached and
        // in-flight keys, until a group's worth of targets is found
        let mut targets = Vec::with_capacity(self.prefetch_group);
        let width = (out_frame - in_frame).max(0);
        'scan: for offset in 0..=width {
            for frame in [center + offset, center - offset] {
                if frame < in_frame || frame > out_frame {
                    continue;
                }
                if self.cache.utility_for_caching(frame) <= 0.0 {
                    continue;
                }
                let probe_ctx = EvalContext::for_frame(frame);
                let key = CacheKey::for_node(view, probe_ctx);
                if self.cache.is_key_active(&key) {
                    continue;
                }
                if !targets.contains(&frame) {
                    targets.push(frame);
                }
                if targets.len() >= self.prefetch_group {
                    break 'scan;
                }
            }
        }

        for frame in targets {
            let graph = Arc::clone(&self.graph);
            let cache = Arc::clone(&self.cache);
            let pool = Arc::clone(&self.pool);
            let view_node = Arc::clone(&self.view_node);
            let display_fps = *self.display_fps.lock().unwrap_or_else(|e| e.into_inner());

            self.workers.execute_with_epoch(epoch, move || {
                let Some(view) = *view_node.lock().unwrap_or_else(|e| e.into_inner()) else {
                    return;
                };
                let graph = graph.read().unwrap_or_else(|e| e.into_inner());
                let mut ctx = EvalContext::for_frame(frame);
                ctx.thread = ThreadKind::CachePrefetch;
                ctx.fps = if display_fps > 0.0 {
                    display_fps
                } else {
                    DEFAULT_FPS
                };

                let key = CacheKey::for_node(view, ctx);
                match cache.try_checkout(&key) {
                    Checkout::Ready(_) => cache.check_in(&key),
                    Checkout::Pending => {}
                    Checkout::Build(ticket) => {
                        match graph.evaluate_cached(view, &cache, Some(&pool), ctx) {
                            Ok(image) => {
                                cache.complete(ticket, image);
                                cache.check_in(&key);
                            }
                            Err(e) => {
                                // Ticket drop releases the claim
                                debug!("prefetch of frame {} failed: {}", frame, e);
                            }
                        }
                    }
                }
            });
        }
    }

    // ========== Audio ==========

    /// Fill the buffer's sample window from the audio graph. Served from
    /// the chunk cache when possible; a miss renders inline and asks the
    /// audio thread to stay ahead of the play position.
    pub fn audio_fill_buffer(&self, buf: &mut AudioBuffer, actx: AudioContext) -> usize {
        let Some(view) = self.view_node() else {
            return 0;
        };
        let generation = self.audio.generation.load(Ordering::Relaxed);
        let key = AudioChunkKey {
            start_sample: buf.start_sample(),
            len: buf.len(),
            channels: buf.channels(),
            rate: buf.rate(),
            generation,
        };

        let cached = {
            let mut cache = self.audio.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(&key).cloned()
        };

        let n = if let Some(samples) = cached {
            buf.data_mut().copy_from_slice(&samples);
            buf.len()
        } else {
            let n = {
                let graph = self.graph.read().unwrap_or_else(|e| e.into_inner());
                graph.audio_fill(view, buf, actx)
            };
            let mut cache = self.audio.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.put(key, Arc::new(buf.data().to_vec()));
            n
        };

        if let Some(tx) = &self.prime_tx {
            let _ = tx.send(PrimeRequest {
                start_sample: buf.start_sample(),
                len: buf.len(),
                channels: buf.channels(),
                rate: buf.rate(),
                fps: actx.fps,
            });
        }
        n
    }

    pub fn flush_audio_cache(&self) {
        self.audio.generation.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.audio.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
    }

    // ========== Work items ==========

    /// Queue a background job off the evaluation threads. Failures are
    /// logged by the executor, not rethrown.
    pub fn add_work_item(
        &self,
        f: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        tag: &str,
    ) -> WorkItemId {
        self.work_items.add(f, tag)
    }

    pub fn remove_work_item(&self, id: WorkItemId) {
        self.work_items.remove(id);
    }

    pub fn wait_work_item(&self, id: WorkItemId) {
        self.work_items.wait(id);
    }

    pub fn prioritize_work_item(&self, id: WorkItemId) {
        self.work_items.prioritize(id);
    }

    // ========== Graph edits ==========

    /// Open a graph-edit bracket. Blocks until in-flight evaluations
    /// drain; edits made through the guard accumulate their flush
    /// classes, applied when the guard drops.
    pub fn edit(&self) -> GraphEdit<'_> {
        let guard = self.graph.write().unwrap_or_else(|e| e.into_inner());
        GraphEdit {
            sched: self,
            guard: Some(guard),
            flush: FlushClass::NONE,
            touched: Vec::new(),
        }
    }

    /// Deferred graph events drained at the last bracket end
    pub fn drain_events(&self) -> Vec<GraphEvent> {
        std::mem::take(
            &mut *self
                .pending_events
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        )
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Closing the prime channel stops the audio thread
        self.prime_tx = None;
        if let Some(handle) = self.audio_thread.take() {
            let _ = handle.join();
        }
    }
}

/// RAII graph-edit bracket. Derefs to [`Graph`]; prefer the wrapper
/// methods so flushes are tracked.
pub struct GraphEdit<'a> {
    sched: &'a Scheduler,
    guard: Option<RwLockWriteGuard<'a, Graph>>,
    flush: FlushClass,
    touched: Vec<Uuid>,
}

impl GraphEdit<'_> {
    /// Property edit with flush tracking
    pub fn set_attr(
        &mut self,
        id: Uuid,
        key: &str,
        value: crate::graph::attrs::AttrValue,
    ) -> Result<(), crate::error::GraphError> {
        let flush = self.guard.as_mut().unwrap().set_attr(id, key, value)?;
        self.flush = self.flush.union(flush);
        if flush.frames {
            self.touched.push(id);
        }
        Ok(())
    }

    /// Topology edit with flush tracking
    pub fn set_node_inputs(
        &mut self,
        id: Uuid,
        inputs: Vec<Uuid>,
    ) -> Result<(), crate::error::GraphError> {
        self.guard.as_mut().unwrap().set_node_inputs(id, inputs)?;
        self.flush = self.flush.union(FlushClass::FRAMES_AND_AUDIO);
        self.touched.push(id);
        Ok(())
    }

    pub fn add_node(&mut self, node: NodeKind) -> Uuid {
        self.guard.as_mut().unwrap().add_node(node)
    }

    pub fn remove_node(&mut self, id: Uuid) -> Result<(), crate::error::GraphError> {
        self.guard.as_mut().unwrap().remove_node(id)?;
        self.flush = self.flush.union(FlushClass::FRAMES_AND_AUDIO);
        self.touched.push(id);
        Ok(())
    }
}

impl Deref for GraphEdit<'_> {
    type Target = Graph;

    fn deref(&self) -> &Graph {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for GraphEdit<'_> {
    fn deref_mut(&mut self) -> &mut Graph {
        self.guard.as_mut().unwrap()
    }
}

impl Drop for GraphEdit<'_> {
    fn drop(&mut self) {
        let guard = self.guard.take().unwrap();

        // Collect the flush set (touched nodes and everything downstream)
        // while the graph is still exclusively ours
        let mut flush_nodes = Vec::new();
        if self.flush.frames && !self.flush.program {
            let mut seen = std::collections::HashSet::new();
            let mut queue: std::collections::VecDeque<Uuid> =
                self.touched.iter().copied().collect();
            while let Some(id) = queue.pop_front() {
                if !seen.insert(id) {
                    continue;
                }
                flush_nodes.push(id);
                queue.extend(guard.dependents(id).iter().copied());
            }
        }
        let events = guard.observers().drain();

        // Resume scheduling before touching the caches
        drop(guard);

        if self.flush.program {
            self.sched.cache.flush_all();
        } else {
            for id in flush_nodes {
                self.sched.cache.flush_node(id);
            }
        }
        if self.flush.audio {
            self.sched.flush_audio_cache();
        }
        if !self.flush.is_none() {
            self.sched.budget.increment_epoch();
        }

        if !events.is_empty() {
            self.sched
                .pending_events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(events);
        }
    }
}
