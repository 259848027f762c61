//! RUSHES - frame/audio evaluation and cache engine
//!
//! Drives a directed graph of processing nodes (sources, retimes, sequences,
//! stacks) that remap frame numbers between their output and their inputs,
//! evaluates each distinct (node, frame, context) key at most once, caches
//! the resulting image trees with check-out/check-in reference counting, and
//! recycles fixed-identity buffers through a fenced resource pool.
//!
//! Decode I/O and GPU backends are external collaborators consumed through
//! narrow traits ([`media::FrameReader`], fences on the pool); this crate
//! owns the evaluation contract, the frame-mapping math, the cache, and the
//! scheduling.

// Engine core (cache, pool, scheduler, events)
pub mod cache;
pub mod events;
pub mod pool;
pub mod sched;

// Graph entities (nodes, attrs, images)
pub mod graph;

// Flat support modules
pub mod audio;
pub mod config;
pub mod error;
pub mod media;
pub mod memo;

// Re-export commonly used types from the engine core
pub use cache::frame_cache::{CacheKey, CachingMode, Checkout, FrameCache};
pub use cache::mem::CacheBudget;
pub use pool::{PoolFence, ResourcePool};
pub use sched::scheduler::{CheckedOutImage, Scheduler};

// Re-export graph entities
pub use graph::attrs::{AttrValue, Attrs};
pub use graph::graph::Graph;
pub use graph::image::{IdTree, Image};
pub use graph::node::{EvalContext, EvalEnv, Eye, Node, RangeInfo, StructureInfo, ThreadKind};
pub use graph::node_kind::NodeKind;

pub use config::EngineConfig;
pub use error::EvalError;
