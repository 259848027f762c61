//! Node trait - the evaluation contract every graph vertex implements.
//!
//! Node kinds are a closed set dispatched through [`NodeKind`]
//! (super::node_kind); the graph never inspects runtime types. Each node
//! holds a property container, an ordered input list (non-owning ids; the
//! graph owns all nodes) and lazily cached range/structure info.
//!
//! Frame remapping lives in the node kinds themselves: a node derives a new
//! context (usually only the frame changes) when calling into its inputs.

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext};
use crate::cache::frame_cache::FrameCache;
use crate::error::EvalError;
use crate::graph::attrs::Attrs;
use crate::graph::graph::Graph;
use crate::graph::image::{IdTree, Image};
use crate::pool::StagingPool;

/// Which evaluation path is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadKind {
    /// Synchronous display evaluation
    Display,
    /// Background prefetch; never blocks on another thread's build
    CachePrefetch,
    /// The audio mixdown thread
    Audio,
}

/// Stereo eye selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Eye {
    #[default]
    Mono,
    Left,
    Right,
}

/// Immutable per-request parameters, copied down the call chain.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    /// Frame being evaluated at the current node
    pub frame: i32,
    /// Frame of the top-level request, before any remapping
    pub base_frame: i32,
    pub thread: ThreadKind,
    pub eye: Eye,
    /// Live viewport, only meaningful when `interactive` is set
    pub view_width: u32,
    pub view_height: u32,
    /// Interactive resize: the viewport overrides cached structure info and
    /// becomes part of the cache key
    pub interactive: bool,
    /// Target display fps
    pub fps: f32,
}

impl EvalContext {
    pub fn for_frame(frame: i32) -> Self {
        Self {
            frame,
            base_frame: frame,
            thread: ThreadKind::Display,
            eye: Eye::Mono,
            view_width: 0,
            view_height: 0,
            interactive: false,
            fps: 0.0,
        }
    }

    /// Same request, different frame - the usual input derivation
    pub fn with_frame(mut self, frame: i32) -> Self {
        self.frame = frame;
        self
    }
}

/// Engine services available during evaluation.
///
/// The graph reference is the shared-read snapshot every worker evaluates
/// against; cache and pool are optional so nodes degrade to uncached,
/// unpooled evaluation in isolation (and in most unit tests).
pub struct EvalEnv<'a> {
    pub graph: &'a Graph,
    pub cache: Option<&'a FrameCache>,
    pub pool: Option<&'a StagingPool>,
}

impl<'a> EvalEnv<'a> {
    pub fn bare(graph: &'a Graph) -> Self {
        Self {
            graph,
            cache: None,
            pool: None,
        }
    }
}

/// Valid frame range of a node's output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeInfo {
    pub start: i32,
    pub end: i32,
    /// Editorial cut points within start..end
    pub cut_in: i32,
    pub cut_out: i32,
    /// 0.0 = not yet discovered
    pub fps: f32,
}

impl Default for RangeInfo {
    fn default() -> Self {
        Self {
            start: 1,
            end: 1,
            cut_in: 1,
            cut_out: 1,
            fps: 0.0,
        }
    }
}

impl RangeInfo {
    pub fn duration(&self) -> i32 {
        (self.end - self.start + 1).max(0)
    }

    pub fn cut_duration(&self) -> i32 {
        (self.cut_out - self.cut_in + 1).max(0)
    }

    pub fn contains(&self, frame: i32) -> bool {
        frame >= self.start && frame <= self.end
    }
}

/// Image geometry of a node's output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StructureInfo {
    pub width: u32,
    pub height: u32,
    pub pixel_aspect: f32,
}

impl Default for StructureInfo {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            pixel_aspect: 1.0,
        }
    }
}

/// What a property edit forces the engine to throw away.
///
/// Accumulated over a graph-edit bracket and applied once at its end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushClass {
    /// Cached frames of this node and its dependents are stale
    pub frames: bool,
    /// Every cached frame in the program is stale
    pub program: bool,
    /// Cached audio mixdown is stale
    pub audio: bool,
}

impl FlushClass {
    pub const NONE: FlushClass = FlushClass {
        frames: false,
        program: false,
        audio: false,
    };
    pub const FRAMES: FlushClass = FlushClass {
        frames: true,
        program: false,
        audio: false,
    };
    pub const AUDIO: FlushClass = FlushClass {
        frames: false,
        program: false,
        audio: true,
    };
    pub const FRAMES_AND_AUDIO: FlushClass = FlushClass {
        frames: true,
        program: false,
        audio: true,
    };
    pub const PROGRAM: FlushClass = FlushClass {
        frames: true,
        program: true,
        audio: true,
    };

    pub fn union(self, other: FlushClass) -> FlushClass {
        FlushClass {
            frames: self.frames || other.frames,
            program: self.program || other.program,
            audio: self.audio || other.audio,
        }
    }

    pub fn is_none(&self) -> bool {
        !(self.frames || self.program || self.audio)
    }
}

/// Base trait for all node kinds.
#[enum_dispatch]
pub trait Node: Send + Sync {
    /// Unique identifier for this node
    fn uuid(&self) -> Uuid;

    /// Display name of the node
    fn name(&self) -> &str;

    /// Type identifier string ("source", "retime", ...)
    fn node_type(&self) -> &'static str;

    /// Access to the node's property container
    fn attrs(&self) -> &Attrs;

    /// Mutable access to properties. Callers must follow up with
    /// `property_changed` for each edited key.
    fn attrs_mut(&mut self) -> &mut Attrs;

    /// Ordered upstream ids. Empty for leaves.
    fn inputs(&self) -> &[Uuid];

    fn set_inputs(&mut self, inputs: Vec<Uuid>);

    /// Input arity limit, usize::MAX = unbounded
    fn max_inputs(&self) -> usize {
        usize::MAX
    }

    /// Evaluate this node at `ctx.frame`, recursively pulling remapped
    /// frames from inputs. `Image::no_image` for intentionally-empty,
    /// `EvalError::EvaluationFailed` when a non-empty input breaks.
    fn evaluate(&self, env: &EvalEnv, ctx: EvalContext) -> Result<Image, EvalError>;

    /// Content-identity tree for the same request, without materializing
    /// samples. Must stay consistent with `evaluate`: equal identifiers
    /// imply reusable cached results.
    fn evaluate_identifier(&self, env: &EvalEnv, ctx: EvalContext) -> Result<IdTree, EvalError>;

    /// Valid output range; lazily recomputed, cached until invalidated
    fn range_info(&self, graph: &Graph) -> RangeInfo;

    /// Output geometry; lazily cached, overridden by a live viewport when
    /// the context is interactive
    fn structure_info(&self, graph: &Graph, ctx: EvalContext) -> StructureInfo;

    /// Add this node's contribution for the buffer's sample window.
    /// Returns samples written (0 = silent here).
    fn audio_fill_buffer(&self, env: &EvalEnv, buf: &mut AudioBuffer, actx: AudioContext)
    -> usize;

    /// Invalidate derived state keyed to `key`; report what must be flushed
    fn property_changed(&self, key: &str) -> FlushClass;

    /// An upstream node's range changed
    fn input_range_changed(&self);

    /// An upstream node's image structure changed
    fn input_structure_changed(&self);

    /// Map frames in input `index`'s timeline to this node's output
    /// timeline (the inverse of the remap applied during evaluate).
    fn map_input_to_eval_frames(&self, _index: usize, frames: &[i32], _graph: &Graph) -> Vec<i32> {
        frames.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_with_frame_keeps_base() {
        let ctx = EvalContext::for_frame(100);
        let derived = ctx.with_frame(50);
        assert_eq!(derived.frame, 50);
        assert_eq!(derived.base_frame, 100);
    }

    #[test]
    fn test_range_durations() {
        let info = RangeInfo {
            start: 1,
            end: 48,
            cut_in: 10,
            cut_out: 20,
            fps: 24.0,
        };
        assert_eq!(info.duration(), 48);
        assert_eq!(info.cut_duration(), 11);
        assert!(info.contains(1));
        assert!(!info.contains(49));
    }

    #[test]
    fn test_flush_class_union() {
        let fc = FlushClass::FRAMES.union(FlushClass::AUDIO);
        assert!(fc.frames && fc.audio && !fc.program);
        assert!(FlushClass::NONE.is_none());
        assert!(FlushClass::PROGRAM.frames);
    }
}
