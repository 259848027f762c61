//! SequenceNode - plays its inputs back to back.
//!
//! An EDL is derived lazily from the inputs' cut ranges: the output timeline
//! starts at frame 1 and each input contributes its cut duration. Exactly
//! one input is pulled per evaluated frame.

use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext, frame_to_sample};
use crate::error::EvalError;
use crate::graph::attrs::Attrs;
use crate::graph::graph::Graph;
use crate::graph::image::{IdTree, Image};
use crate::graph::node::{
    EvalContext, EvalEnv, FlushClass, Node, RangeInfo, StructureInfo,
};
use crate::memo::Memoized;

/// One EDL entry in output-timeline order
#[derive(Debug, Clone, Copy)]
struct Segment {
    input: Uuid,
    /// Output frame this segment starts at
    global_start: i32,
    len: i32,
    /// Input frame mapped by global_start
    cut_in: i32,
    /// Input's own range start (anchors its audio timeline)
    start: i32,
    fps: f32,
}

#[derive(Debug, Clone, Default)]
struct Edl {
    segments: Vec<Segment>,
    total: i32,
    fps: f32,
}

/// Where a frame lands: (input index, input frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalPoint {
    pub source_index: usize,
    pub source_frame: i32,
}

pub struct SequenceNode {
    uuid: Uuid,
    name: String,
    attrs: Attrs,
    inputs: Vec<Uuid>,
    edl: Memoized<Edl>,
}

impl SequenceNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            attrs: Attrs::new(),
            inputs: Vec::new(),
            edl: Memoized::new(),
        }
    }

    fn edl(&self, graph: &Graph) -> Edl {
        self.edl.get_or_update(|| {
            let mut segments = Vec::with_capacity(self.inputs.len());
            let mut acc = 1;
            let mut fps = 0.0;

            for &input in &self.inputs {
                let Some(node) = graph.node(input) else {
                    continue;
                };
                let info = node.range_info(graph);
                let len = info.cut_duration().max(1);
                if fps == 0.0 {
                    fps = info.fps;
                }
                segments.push(Segment {
                    input,
                    global_start: acc,
                    len,
                    cut_in: info.cut_in,
                    start: info.start,
                    fps: info.fps,
                });
                acc += len;
            }

            Edl {
                segments,
                total: acc - 1,
                fps,
            }
        })
    }

    /// Segment index covering an output frame (clamped to the EDL)
    fn index_at_frame(edl: &Edl, frame: i32) -> usize {
        let f = frame.clamp(1, edl.total.max(1));
        for (i, seg) in edl.segments.iter().enumerate() {
            if f < seg.global_start + seg.len {
                return i;
            }
        }
        edl.segments.len().saturating_sub(1)
    }

    /// Resolve an output frame to (input index, input frame)
    pub fn evaluation_point(&self, graph: &Graph, frame: i32) -> Option<EvalPoint> {
        let edl = self.edl(graph);
        if edl.segments.is_empty() {
            return None;
        }
        let index = Self::index_at_frame(&edl, frame);
        let seg = &edl.segments[index];
        let f = frame.clamp(1, edl.total);
        Some(EvalPoint {
            source_index: index,
            source_frame: seg.cut_in + (f - seg.global_start),
        })
    }
}

impl Node for SequenceNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "sequence"
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

    fn set_inputs(&mut self, inputs: Vec<Uuid>) {
        self.inputs = inputs;
        self.edl.invalidate();
    }

    fn evaluate(&self, env: &EvalEnv, ctx: EvalContext) -> Result<Image, EvalError> {
        let Some(ep) = self.evaluation_point(env.graph, ctx.frame) else {
            return Ok(Image::no_image(self.uuid));
        };
        let input = self.inputs[ep.source_index];
        let node = env.graph.node(input).ok_or(EvalError::UnknownNode(input))?;

        let child = node.evaluate(env, ctx.with_frame(ep.source_frame))?;
        if child.is_no_image() {
            return Err(EvalError::EvaluationFailed {
                node: input,
                node_name: node.name().to_string(),
                frame: ep.source_frame,
            });
        }

        let sinfo = self.structure_info(env.graph, ctx);
        let mut root = Image::blend_root(self.uuid, sinfo.width, sinfo.height);
        root.children.push(child);
        Ok(root)
    }

    fn evaluate_identifier(&self, env: &EvalEnv, ctx: EvalContext) -> Result<IdTree, EvalError> {
        let Some(ep) = self.evaluation_point(env.graph, ctx.frame) else {
            return Ok(IdTree::leaf("no-image"));
        };
        let input = self.inputs[ep.source_index];
        let node = env.graph.node(input).ok_or(EvalError::UnknownNode(input))?;
        let child = node.evaluate_identifier(env, ctx.with_frame(ep.source_frame))?;
        Ok(IdTree::branch(
            format!("sequence/{}", ep.source_index),
            vec![child],
        ))
    }

    fn range_info(&self, graph: &Graph) -> RangeInfo {
        let edl = self.edl(graph);
        RangeInfo {
            start: 1,
            end: edl.total.max(1),
            cut_in: 1,
            cut_out: edl.total.max(1),
            fps: edl.fps,
        }
    }

    fn structure_info(&self, graph: &Graph, ctx: EvalContext) -> StructureInfo {
        if ctx.interactive && ctx.view_width > 0 && ctx.view_height > 0 {
            return StructureInfo {
                width: ctx.view_width,
                height: ctx.view_height,
                pixel_aspect: 1.0,
            };
        }
        match self.evaluation_point(graph, ctx.frame) {
            Some(ep) => {
                let input = self.inputs[ep.source_index];
                graph
                    .node(input)
                    .map(|n| n.structure_info(graph, ctx.with_frame(ep.source_frame)))
                    .unwrap_or_default()
            }
            None => StructureInfo::default(),
        }
    }

    fn audio_fill_buffer(
        &self,
        env: &EvalEnv,
        buf: &mut AudioBuffer,
        actx: AudioContext,
    ) -> usize {
        let edl = self.edl(env.graph);
        if edl.segments.is_empty() {
            return 0;
        }
        let fps = if actx.fps > 0.0 { actx.fps } else { edl.fps };
        if fps <= 0.0 {
            return 0;
        }

        // Resolve the segment at the window start; device buffers are short
        // relative to cuts, so one segment per fill is the common case
        let rate = buf.rate();
        let start_frame =
            (buf.start_time() * fps as f64).floor() as i32 + 1;
        let index = Self::index_at_frame(&edl, start_frame);
        let seg = &edl.segments[index];
        let Some(node) = env.graph.node(seg.input) else {
            return 0;
        };

        // Shift the window into the input's local timeline: sample 0 of a
        // child aligns with its own range start
        let frame_shift = (seg.cut_in - seg.start) - (seg.global_start - 1);
        let shift = frame_to_sample(frame_shift, fps, rate);
        let mut scratch = AudioBuffer::like(buf, buf.start_sample() + shift);
        let n = node.audio_fill_buffer(env, &mut scratch, AudioContext { fps: seg.fps });
        buf.mix_from(&scratch);
        n
    }

    fn property_changed(&self, _key: &str) -> FlushClass {
        self.edl.invalidate();
        FlushClass::FRAMES_AND_AUDIO
    }

    fn input_range_changed(&self) {
        self.edl.invalidate();
    }

    fn input_structure_changed(&self) {}

    fn map_input_to_eval_frames(&self, index: usize, frames: &[i32], graph: &Graph) -> Vec<i32> {
        let edl = self.edl(graph);
        let Some(seg) = edl.segments.get(index) else {
            return frames.to_vec();
        };
        frames
            .iter()
            .map(|f| seg.global_start + (f - seg.cut_in))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node_kind::NodeKind;
    use crate::graph::source_node::SourceNode;
    use crate::media::{FrameReader, SyntheticReader};
    use std::sync::Arc;

    fn sequence_of(clips: &[(i32, i32)]) -> (Graph, Uuid, Vec<Uuid>) {
        let mut graph = Graph::new();
        let mut ids = Vec::new();
        for (i, (start, end)) in clips.iter().enumerate() {
            let reader = Arc::new(SyntheticReader::new(format!("clip{i}"), *start, *end, 24.0));
            ids.push(
                graph.add_node(
                    SourceNode::new(format!("clip{i}"), reader as Arc<dyn FrameReader>).into(),
                ),
            );
        }
        let seq = graph.add_node(SequenceNode::new("seq").into());
        graph.set_node_inputs(seq, ids.clone()).unwrap();
        (graph, seq, ids)
    }

    fn seq_node<'a>(graph: &'a Graph, id: Uuid) -> &'a SequenceNode {
        match graph.node(id).unwrap() {
            NodeKind::Sequence(n) => n,
            _ => panic!("not a sequence"),
        }
    }

    #[test]
    fn test_edl_concatenates_cut_ranges() {
        let (graph, seq, _) = sequence_of(&[(1, 10), (101, 120)]);
        let info = graph.node(seq).unwrap().range_info(&graph);
        assert_eq!((info.start, info.end), (1, 30));
    }

    #[test]
    fn test_evaluation_point_resolves_segments() {
        let (graph, seq, _) = sequence_of(&[(1, 10), (101, 120)]);
        let node = seq_node(&graph, seq);

        let ep = node.evaluation_point(&graph, 1).unwrap();
        assert_eq!((ep.source_index, ep.source_frame), (0, 1));
        let ep = node.evaluation_point(&graph, 10).unwrap();
        assert_eq!((ep.source_index, ep.source_frame), (0, 10));
        let ep = node.evaluation_point(&graph, 11).unwrap();
        assert_eq!((ep.source_index, ep.source_frame), (1, 101));
        let ep = node.evaluation_point(&graph, 30).unwrap();
        assert_eq!((ep.source_index, ep.source_frame), (1, 120));
        // Out of range clamps to the ends
        let ep = node.evaluation_point(&graph, 0).unwrap();
        assert_eq!((ep.source_index, ep.source_frame), (0, 1));
        let ep = node.evaluation_point(&graph, 99).unwrap();
        assert_eq!((ep.source_index, ep.source_frame), (1, 120));
    }

    #[test]
    fn test_evaluate_pulls_single_input() {
        let (graph, seq, _) = sequence_of(&[(1, 10), (101, 120)]);
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(seq)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(12))
            .unwrap();
        assert_eq!(img.children.len(), 1);
        assert_eq!(img.children[0].payload.as_ref().unwrap().data[0], 102.0);
    }

    #[test]
    fn test_identifier_tracks_segment() {
        let (graph, seq, _) = sequence_of(&[(1, 10), (101, 120)]);
        let env = EvalEnv::bare(&graph);
        let a = graph
            .node(seq)
            .unwrap()
            .evaluate_identifier(&env, EvalContext::for_frame(5))
            .unwrap();
        let b = graph
            .node(seq)
            .unwrap()
            .evaluate_identifier(&env, EvalContext::for_frame(15))
            .unwrap();
        assert_eq!(a.flatten(), "sequence/0|clip0/5");
        assert_eq!(b.flatten(), "sequence/1|clip1/105");
    }

    #[test]
    fn test_map_input_frames_to_output() {
        let (graph, seq, _) = sequence_of(&[(1, 10), (101, 120)]);
        let node = seq_node(&graph, seq);
        assert_eq!(node.map_input_to_eval_frames(0, &[1, 10], &graph), vec![1, 10]);
        assert_eq!(
            node.map_input_to_eval_frames(1, &[101, 120], &graph),
            vec![11, 30]
        );
    }

    #[test]
    fn test_empty_sequence_is_no_image() {
        let mut graph = Graph::new();
        let seq = graph.add_node(SequenceNode::new("seq").into());
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(seq)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(1))
            .unwrap();
        assert!(img.is_no_image());
    }
}
