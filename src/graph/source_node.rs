//! SourceNode - leaf producer backed by a decode plugin.
//!
//! The reader is an opaque collaborator; its results are cached exactly like
//! any other node's. Concurrent evaluations of the same (frame, context) key
//! resolve to a single reader call: the first thread claims the build, the
//! rest block on the cache until the entry is ready.

use std::sync::Arc;

use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext};
use crate::cache::frame_cache::{CacheKey, Checkout};
use crate::error::EvalError;
use crate::graph::attrs::Attrs;
use crate::graph::graph::Graph;
use crate::graph::image::{IdTree, Image};
use crate::graph::node::{
    EvalContext, EvalEnv, FlushClass, Node, RangeInfo, StructureInfo,
};
use crate::media::FrameReader;
use crate::memo::Memoized;

pub struct SourceNode {
    uuid: Uuid,
    name: String,
    attrs: Attrs,
    inputs: Vec<Uuid>,
    reader: Arc<dyn FrameReader>,
    range: Memoized<RangeInfo>,
    structure: Memoized<StructureInfo>,
}

impl SourceNode {
    pub fn new(name: impl Into<String>, reader: Arc<dyn FrameReader>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            attrs: Attrs::new(),
            inputs: Vec::new(),
            reader,
            range: Memoized::new(),
            structure: Memoized::new(),
        }
    }

    pub fn reader(&self) -> &Arc<dyn FrameReader> {
        &self.reader
    }

    /// Clamp a requested frame into the media range
    fn clamp_frame(&self, frame: i32) -> i32 {
        let info = self.range.get_or_update(|| self.reader.range());
        frame.clamp(info.start, info.end)
    }

    /// Decode one frame and stage it for upload.
    ///
    /// The staging lease models the host-to-GPU copy: acquire a recycled
    /// buffer sized for the payload, fill it, release it with the fence
    /// armed. A pool refusal (hard memory floor) falls back to the unpooled
    /// path instead of failing the frame.
    fn build(&self, env: &EvalEnv, frame: i32) -> Result<Image, EvalError> {
        let payload = self.reader.read_frame(frame)?;

        if let Some(pool) = env.pool {
            if let Some(mut lease) = pool.acquire(payload.data.len()) {
                let n = payload.data.len().min(lease.resource.len());
                lease.resource[..n].copy_from_slice(&payload.data[..n]);
                pool.release(lease);
            } else {
                log::debug!(
                    "source '{}': staging pool refused {} samples, uploading unpooled",
                    self.name,
                    payload.data.len()
                );
            }
        }

        Ok(Image::leaf(self.uuid, Arc::new(payload)))
    }
}

impl Node for SourceNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "source"
    }

    fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    fn attrs_mut(&mut self) -> &mut Attrs {
        &mut self.attrs
    }

    fn inputs(&self) -> &[Uuid] {
        &self.inputs
    }

    fn set_inputs(&mut self, _inputs: Vec<Uuid>) {
        // Leaf node; the graph rejects inputs via max_inputs
    }

    fn max_inputs(&self) -> usize {
        0
    }

    fn evaluate(&self, env: &EvalEnv, ctx: EvalContext) -> Result<Image, EvalError> {
        let frame = self.clamp_frame(ctx.frame);

        let Some(cache) = env.cache else {
            return self.build(env, frame);
        };

        let key = CacheKey::for_node(self.uuid, ctx.with_frame(frame));
        match cache.checkout_blocking(&key) {
            Checkout::Ready(img) => {
                let image = (*img).clone();
                cache.check_in(&key);
                Ok(image)
            }
            Checkout::Build(ticket) => {
                // On error the ticket drops and releases the claim, so a
                // blocked thread can retry instead of waiting forever.
                let image = self.build(env, frame)?;
                let arc = cache.complete(ticket, image);
                let image = (*arc).clone();
                cache.check_in(&key);
                Ok(image)
            }
            Checkout::Pending => Err(EvalError::BuildAbandoned {
                node: self.uuid,
                frame,
            }),
        }
    }

    fn evaluate_identifier(&self, _env: &EvalEnv, ctx: EvalContext) -> Result<IdTree, EvalError> {
        let frame = self.clamp_frame(ctx.frame);
        Ok(IdTree::leaf(self.reader.identifier(frame)))
    }

    fn range_info(&self, _graph: &Graph) -> RangeInfo {
        self.range.get_or_update(|| self.reader.range())
    }

    fn structure_info(&self, _graph: &Graph, ctx: EvalContext) -> StructureInfo {
        if ctx.interactive && ctx.view_width > 0 && ctx.view_height > 0 {
            return StructureInfo {
                width: ctx.view_width,
                height: ctx.view_height,
                pixel_aspect: 1.0,
            };
        }
        self.structure.get_or_update(|| self.reader.structure())
    }

    fn audio_fill_buffer(
        &self,
        _env: &EvalEnv,
        buf: &mut AudioBuffer,
        _actx: AudioContext,
    ) -> usize {
        self.reader.read_audio(buf)
    }

    fn property_changed(&self, key: &str) -> FlushClass {
        self.range.invalidate();
        self.structure.invalidate();
        match key {
            crate::graph::keys::A_NAME => FlushClass::NONE,
            _ => FlushClass::FRAMES,
        }
    }

    fn input_range_changed(&self) {
        self.range.invalidate();
    }

    fn input_structure_changed(&self) {
        self.structure.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::graph::Graph;
    use crate::media::SyntheticReader;

    fn graph_with_source(start: i32, end: i32) -> (Graph, Uuid, Arc<SyntheticReader>) {
        let mut graph = Graph::new();
        let reader = Arc::new(SyntheticReader::new("clip", start, end, 24.0));
        let id = graph.add_node(
            SourceNode::new("clip", Arc::clone(&reader) as Arc<dyn FrameReader>).into(),
        );
        (graph, id, reader)
    }

    #[test]
    fn test_evaluate_leaf_payload() {
        let (graph, id, reader) = graph_with_source(1, 48);
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(id)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(7))
            .unwrap();
        assert_eq!(img.leaf_count(), 1);
        assert_eq!(img.payload.as_ref().unwrap().data[0], 7.0);
        assert_eq!(reader.read_count(), 1);
    }

    #[test]
    fn test_evaluate_clamps_to_media_range() {
        let (graph, id, _reader) = graph_with_source(10, 20);
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(id)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(99))
            .unwrap();
        assert_eq!(img.payload.as_ref().unwrap().data[0], 20.0);
    }

    #[test]
    fn test_identifier_tracks_clamped_frame() {
        let (graph, id, _reader) = graph_with_source(1, 48);
        let env = EvalEnv::bare(&graph);
        let tree = graph
            .node(id)
            .unwrap()
            .evaluate_identifier(&env, EvalContext::for_frame(3))
            .unwrap();
        assert_eq!(tree.flatten(), "clip/3");
    }

    #[test]
    fn test_interactive_structure_override() {
        let (graph, id, _reader) = graph_with_source(1, 48);
        let mut ctx = EvalContext::for_frame(1);
        ctx.interactive = true;
        ctx.view_width = 320;
        ctx.view_height = 180;
        let info = graph.node(id).unwrap().structure_info(&graph, ctx);
        assert_eq!((info.width, info.height), (320, 180));
    }
}
