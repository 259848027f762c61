//! StackNode - composites all of its inputs at once.
//!
//! The output range aggregates the children: union of their ranges, or a
//! common-start window when align mode is on. Callers see a 1-based
//! timeline; the internal offset shifts between the two. Per-child global
//! windows are precomputed so audio from out-of-range children is masked
//! out of the mix.

use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext, frame_to_sample};
use crate::error::EvalError;
use crate::graph::attrs::{AttrValue, Attrs};
use crate::graph::graph::Graph;
use crate::graph::image::{BlendMode, IdTree, Image};
use crate::graph::keys::*;
use crate::graph::node::{
    EvalContext, EvalEnv, FlushClass, Node, RangeInfo, StructureInfo,
};
use crate::memo::Memoized;

/// Aggregated range/structure state, rebuilt lazily
#[derive(Debug, Clone, Default)]
struct StackState {
    /// Per-input range info
    infos: Vec<RangeInfo>,
    /// Aggregate range in real child frames
    info: RangeInfo,
    /// info.start - 1: shifts the 1-based output timeline to real frames
    offset: i32,
    /// Per-input valid windows in output frames, for audio masking
    global_ranges: Vec<(i32, i32)>,
    structure: StructureInfo,
}

pub struct StackNode {
    uuid: Uuid,
    name: String,
    attrs: Attrs,
    inputs: Vec<Uuid>,
    state: Memoized<StackState>,
}

impl StackNode {
    pub fn new(name: impl Into<String>) -> Self {
        let mut attrs = Attrs::new();
        attrs.set(A_USE_CUT_INFO, AttrValue::Bool(true));
        attrs.set(A_ALIGN_START, AttrValue::Bool(false));
        attrs.set(A_STRICT_RANGES, AttrValue::Bool(false));
        attrs.set(A_COMP_MODE, AttrValue::Str("over".to_string()));
        attrs.set(A_AUTO_SIZE, AttrValue::Bool(true));
        attrs.set(A_OUTPUT_FPS, AttrValue::Float(0.0));
        attrs.set(A_AUDIO_INPUT, AttrValue::Int(-2));

        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            attrs,
            inputs: Vec::new(),
            state: Memoized::new(),
        }
    }

    fn use_cut_info(&self) -> bool {
        self.attrs.get_bool_or(A_USE_CUT_INFO, true)
    }

    fn align_start_frames(&self) -> bool {
        self.attrs.get_bool_or(A_ALIGN_START, false)
    }

    fn state(&self, graph: &Graph) -> StackState {
        self.state.get_or_update(|| self.compute_state(graph))
    }

    fn compute_state(&self, graph: &Graph) -> StackState {
        let use_cut = self.use_cut_info();
        let align = self.align_start_frames();

        let mut state = StackState::default();
        let mut max_duration = 0;

        for (i, &input) in self.inputs.iter().enumerate() {
            let Some(node) = graph.node(input) else {
                state.infos.push(RangeInfo::default());
                continue;
            };
            let info = node.range_info(graph);
            let ctx = EvalContext::for_frame(info.start);
            let sinfo = node.structure_info(graph, ctx);
            state.infos.push(info);

            if i == 0 {
                state.info = info;
                state.structure.width = sinfo.width;
                state.structure.height = sinfo.height;
                state.structure.pixel_aspect = 1.0;
                if use_cut {
                    state.info.start = info.cut_in;
                    state.info.end = info.cut_out;
                }
                max_duration = state.info.duration();
            } else {
                state.structure.width = state.structure.width.max(sinfo.width);
                state.structure.height = state.structure.height.max(sinfo.height);

                let duration;
                if use_cut {
                    state.info.start = state.info.start.min(info.cut_in);
                    state.info.end = state.info.end.max(info.cut_out);
                    duration = info.cut_duration();
                } else {
                    state.info.start = state.info.start.min(info.start);
                    state.info.end = state.info.end.max(info.end);
                    duration = info.duration();
                }
                max_duration = max_duration.max(duration);
            }
        }

        if align {
            state.info.end = state.info.start + max_duration - 1;
        }

        state.info.cut_in = state.info.start;
        state.info.cut_out = state.info.end;
        state.offset = state.info.start - 1;

        let out_fps = self.attrs.get_float_or(A_OUTPUT_FPS, 0.0);
        state.info.fps = if out_fps != 0.0 {
            out_fps
        } else {
            state.infos.first().map(|i| i.fps).unwrap_or(0.0)
        };

        if !self.attrs.get_bool_or(A_AUTO_SIZE, true) {
            state.structure.width = self.attrs.get_u32(A_OUT_WIDTH).unwrap_or(0);
            state.structure.height = self.attrs.get_u32(A_OUT_HEIGHT).unwrap_or(0);
        }

        // Each input's cut window mapped into output frames, cached for
        // audio masking
        for i in 0..state.infos.len() {
            let info = &state.infos[i];
            let a = if use_cut { info.cut_in } else { info.start };
            let b = if use_cut { info.cut_out } else { info.end };
            state.global_ranges.push((
                Self::inv_input_frame(&state, i, a, use_cut, align),
                Self::inv_input_frame(&state, i, b, use_cut, align),
            ));
        }

        state
    }

    /// Child frame -> output frame
    fn inv_input_frame(
        state: &StackState,
        index: usize,
        frame: i32,
        use_cut: bool,
        align: bool,
    ) -> i32 {
        if align {
            let info = &state.infos[index];
            let base = if use_cut { info.cut_in } else { info.start };
            state.info.start + (frame - base) - state.offset
        } else {
            frame - state.offset
        }
    }

    /// Output frame -> frame requested of input `index`, clamped to that
    /// input's own range unless `unconstrained` (used when precomputing the
    /// global audio windows).
    fn input_frame_in(
        &self,
        state: &StackState,
        index: usize,
        frame: i32,
        unconstrained: bool,
    ) -> i32 {
        let info = &state.infos[index];
        let use_cut = self.use_cut_info();

        let mut frame = frame + state.offset;
        if !unconstrained {
            frame = frame.clamp(state.info.start, state.info.end);
        }

        if self.align_start_frames() {
            let offset = frame - state.info.start;
            if use_cut {
                let mut f = info.cut_in + offset;
                if !unconstrained && f > info.cut_out {
                    f = info.cut_out;
                }
                f
            } else {
                let mut f = info.start + offset;
                if !unconstrained && f > info.end {
                    f = info.end;
                }
                f
            }
        } else if !unconstrained {
            if use_cut {
                frame.clamp(info.cut_in, info.cut_out)
            } else {
                frame.clamp(info.start, info.end)
            }
        } else {
            frame
        }
    }

    /// Output frame -> input frame (public; recomputes state as needed)
    pub fn input_frame(
        &self,
        graph: &Graph,
        index: usize,
        frame: i32,
        unconstrained: bool,
    ) -> i32 {
        let state = self.state(graph);
        self.input_frame_in(&state, index, frame, unconstrained)
    }
}

impl Node for StackNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "stack"
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
        self.state.invalidate();
    }

    fn evaluate(&self, env: &EvalEnv, ctx: EvalContext) -> Result<Image, EvalError> {
        if self.inputs.is_empty() {
            return Ok(Image::no_image(self.uuid));
        }

        let state = self.state(env.graph);
        let sinfo = self.structure_info(env.graph, ctx);
        let comp = self.attrs.get_str(A_COMP_MODE).unwrap_or("over");
        let topmost = comp == "topmost";
        let strict = self.attrs.get_bool_or(A_STRICT_RANGES, false);
        let use_cut = self.use_cut_info();

        let mut root = Image::blend_root(self.uuid, sinfo.width, sinfo.height);
        root.blend = BlendMode::from_str(comp);

        // Children already in the cache are checked back in as soon as
        // their subtree is cloned, so unwinding on a failed input leaks
        // nothing; partial children drop here.
        for (i, &input) in self.inputs.iter().enumerate() {
            if strict {
                let f = self.input_frame_in(&state, i, ctx.frame, true);
                let info = &state.infos[i];
                let (lo, hi) = if use_cut {
                    (info.cut_in, info.cut_out)
                } else {
                    (info.start, info.end)
                };
                if f < lo || f > hi {
                    continue;
                }
            }

            if topmost && !root.children.is_empty() {
                break;
            }

            let node = env.graph.node(input).ok_or(EvalError::UnknownNode(input))?;
            let mut c = ctx.with_frame(self.input_frame_in(&state, i, ctx.frame, false));
            c.fps = state.info.fps;

            let child = node.evaluate(env, c)?;
            if !child.is_no_image() {
                root.children.push(child);
            }
        }

        Ok(root)
    }

    fn evaluate_identifier(&self, env: &EvalEnv, ctx: EvalContext) -> Result<IdTree, EvalError> {
        if self.inputs.is_empty() {
            return Ok(IdTree::leaf("no-image"));
        }
        let state = self.state(env.graph);
        let comp = self.attrs.get_str(A_COMP_MODE).unwrap_or("over");

        let mut children = Vec::with_capacity(self.inputs.len());
        for (i, &input) in self.inputs.iter().enumerate() {
            let node = env.graph.node(input).ok_or(EvalError::UnknownNode(input))?;
            let c = ctx.with_frame(self.input_frame_in(&state, i, ctx.frame, false));
            children.push(node.evaluate_identifier(env, c)?);
        }
        Ok(IdTree::branch(format!("stack/{comp}"), children))
    }

    fn range_info(&self, graph: &Graph) -> RangeInfo {
        let state = self.state(graph);
        RangeInfo {
            start: state.info.start - state.offset,
            end: state.info.end - state.offset,
            cut_in: state.info.cut_in - state.offset,
            cut_out: state.info.cut_out - state.offset,
            fps: state.info.fps,
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
        self.state(graph).structure
    }

    fn audio_fill_buffer(
        &self,
        env: &EvalEnv,
        buf: &mut AudioBuffer,
        actx: AudioContext,
    ) -> usize {
        if self.inputs.is_empty() {
            return 0;
        }
        let state = self.state(env.graph);
        let fps = if state.info.fps > 0.0 {
            state.info.fps
        } else {
            actx.fps
        };
        if fps <= 0.0 {
            return 0;
        }

        let active = self.attrs.get_i32_or(A_AUDIO_INPUT, -2);
        let rate = buf.rate();
        let mut rval = 0;

        for (i, &input) in self.inputs.iter().enumerate() {
            if active >= 0 && active != i as i32 {
                continue;
            }
            let Some(node) = env.graph.node(input) else {
                continue;
            };

            // Mask children whose output window misses this buffer
            let (win_a, win_b) = state.global_ranges[i];
            let win_start = frame_to_sample(win_a - 1, fps, rate);
            let win_end = frame_to_sample(win_b, fps, rate);
            let buf_start = buf.start_sample();
            let buf_end = buf_start + buf.len() as i64;
            let ov_start = buf_start.max(win_start);
            let ov_end = buf_end.min(win_end);
            if ov_start >= ov_end {
                continue;
            }

            // Shift the window into the child's local timeline
            let foffset =
                self.input_frame_in(&state, i, 1, true) - state.infos[i].start;
            let soffset = frame_to_sample(foffset, fps, rate);

            let mut scratch = AudioBuffer::like(buf, buf_start + soffset);
            let n = node.audio_fill_buffer(env, &mut scratch, AudioContext { fps });

            buf.mix_range_from(
                &scratch,
                (ov_start - buf_start) as usize,
                (ov_end - buf_start) as usize,
            );
            rval = rval.max(n);

            // "first input with audio" mode stops at the first contributor;
            // "topmost" always stops after input 0
            if active == -3 && rval > 0 {
                break;
            }
            if active == -1 {
                break;
            }
        }

        rval
    }

    fn property_changed(&self, key: &str) -> FlushClass {
        self.state.invalidate();
        match key {
            A_AUDIO_INPUT => FlushClass::AUDIO,
            A_USE_CUT_INFO | A_ALIGN_START | A_OUTPUT_FPS => FlushClass::FRAMES_AND_AUDIO,
            A_NAME => FlushClass::NONE,
            _ => FlushClass::FRAMES,
        }
    }

    fn input_range_changed(&self) {
        self.state.invalidate();
    }

    fn input_structure_changed(&self) {
        self.state.invalidate();
    }

    fn map_input_to_eval_frames(&self, index: usize, frames: &[i32], graph: &Graph) -> Vec<i32> {
        let state = self.state(graph);
        let use_cut = self.use_cut_info();
        let align = self.align_start_frames();
        frames
            .iter()
            .map(|f| Self::inv_input_frame(&state, index, *f, use_cut, align))
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

    fn stack_of(clips: &[(i32, i32)]) -> (Graph, Uuid, Vec<Uuid>) {
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
        let stack = graph.add_node(StackNode::new("stack").into());
        graph.set_node_inputs(stack, ids.clone()).unwrap();
        (graph, stack, ids)
    }

    fn stack_node<'a>(graph: &'a Graph, id: Uuid) -> &'a StackNode {
        match graph.node(id).unwrap() {
            NodeKind::Stack(n) => n,
            _ => panic!("not a stack"),
        }
    }

    #[test]
    fn test_union_range_is_one_based() {
        let (graph, stack, _) = stack_of(&[(10, 20), (15, 30)]);
        let info = graph.node(stack).unwrap().range_info(&graph);
        // Union 10..30 presented as 1..21
        assert_eq!((info.start, info.end), (1, 21));
    }

    #[test]
    fn test_align_mode_uses_longest_duration() {
        let (mut graph, stack, _) = stack_of(&[(1, 10), (101, 130)]);
        graph
            .set_attr(stack, A_ALIGN_START, AttrValue::Bool(true))
            .unwrap();
        let info = graph.node(stack).unwrap().range_info(&graph);
        assert_eq!((info.start, info.end), (1, 30));

        let node = stack_node(&graph, stack);
        // Both children start together at output frame 1
        assert_eq!(node.input_frame(&graph, 0, 1, false), 1);
        assert_eq!(node.input_frame(&graph, 1, 1, false), 101);
        // Short child clamps at its end, long one keeps going
        assert_eq!(node.input_frame(&graph, 0, 25, false), 10);
        assert_eq!(node.input_frame(&graph, 1, 25, false), 125);
        // Unconstrained ignores the clamp
        assert_eq!(node.input_frame(&graph, 0, 25, true), 25);
    }

    #[test]
    fn test_input_frame_clamps_to_child_range() {
        let (graph, stack, _) = stack_of(&[(10, 20), (15, 30)]);
        let node = stack_node(&graph, stack);
        // Output frame 1 = real frame 10; child 1 hasn't started yet
        assert_eq!(node.input_frame(&graph, 0, 1, false), 10);
        assert_eq!(node.input_frame(&graph, 1, 1, false), 15);
        // Output frame 21 = real frame 30; child 0 ended at 20
        assert_eq!(node.input_frame(&graph, 0, 21, false), 20);
        assert_eq!(node.input_frame(&graph, 1, 21, false), 30);
    }

    #[test]
    fn test_evaluate_composites_all_children() {
        let (graph, stack, _) = stack_of(&[(1, 20), (1, 20)]);
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(stack)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(5))
            .unwrap();
        assert_eq!(img.children.len(), 2);
        assert_eq!(img.children[0].payload.as_ref().unwrap().data[0], 5.0);
    }

    #[test]
    fn test_topmost_keeps_first_child() {
        let (mut graph, stack, _) = stack_of(&[(1, 20), (1, 20)]);
        graph
            .set_attr(stack, A_COMP_MODE, AttrValue::Str("topmost".into()))
            .unwrap();
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(stack)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(5))
            .unwrap();
        assert_eq!(img.children.len(), 1);
    }

    #[test]
    fn test_strict_ranges_skip_out_of_window_children() {
        let (mut graph, stack, _) = stack_of(&[(1, 10), (11, 20)]);
        graph
            .set_attr(stack, A_STRICT_RANGES, AttrValue::Bool(true))
            .unwrap();
        let env = EvalEnv::bare(&graph);
        // Frame 15 is outside clip0's 1..10 window
        let img = graph
            .node(stack)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(15))
            .unwrap();
        assert_eq!(img.children.len(), 1);
        assert_eq!(img.children[0].payload.as_ref().unwrap().data[0], 15.0);
    }

    #[test]
    fn test_structure_takes_largest_child() {
        let mut graph = Graph::new();
        let a = Arc::new(SyntheticReader::new("a", 1, 10, 24.0).with_size(64, 32));
        let b = Arc::new(SyntheticReader::new("b", 1, 10, 24.0).with_size(128, 16));
        let ia = graph.add_node(SourceNode::new("a", a as Arc<dyn FrameReader>).into());
        let ib = graph.add_node(SourceNode::new("b", b as Arc<dyn FrameReader>).into());
        let stack = graph.add_node(StackNode::new("stack").into());
        graph.set_node_inputs(stack, vec![ia, ib]).unwrap();

        let info = graph
            .node(stack)
            .unwrap()
            .structure_info(&graph, EvalContext::for_frame(1));
        assert_eq!((info.width, info.height), (128, 32));
    }

    #[test]
    fn test_audio_masks_out_of_window_children() {
        // clip1 occupies output frames 11..20; a buffer inside frames 1..10
        // must only hear clip0
        let (graph, stack, ids) = stack_of(&[(1, 10), (11, 20)]);
        let node = stack_node(&graph, stack);
        let env = EvalEnv::bare(&graph);
        let rate = 48000u32;

        let mut buf = AudioBuffer::new(1024, 2, rate, 0);
        let n = node.audio_fill_buffer(&env, &mut buf, AudioContext { fps: 24.0 });
        assert_eq!(n, 1024);

        // clip0 alone, in its local timeline (no shift), is the expectation;
        // an unmasked clip1 would add a shifted sine and break equality
        let mut expected = AudioBuffer::new(1024, 2, rate, 0);
        graph
            .node(ids[0])
            .unwrap()
            .audio_fill_buffer(&env, &mut expected, AudioContext { fps: 24.0 });
        assert_eq!(buf.data(), expected.data());

        // Inside clip1's window (frames 11..20 = samples 20000..40000) only
        // clip1 contributes, shifted into its local timeline
        let mut buf = AudioBuffer::new(1024, 2, rate, 30000);
        node.audio_fill_buffer(&env, &mut buf, AudioContext { fps: 24.0 });
        let mut expected = AudioBuffer::new(1024, 2, rate, 10000);
        graph
            .node(ids[1])
            .unwrap()
            .audio_fill_buffer(&env, &mut expected, AudioContext { fps: 24.0 });
        assert_eq!(buf.data(), expected.data());
    }

    #[test]
    fn test_identifier_covers_all_children() {
        let (graph, stack, _) = stack_of(&[(1, 10), (1, 10)]);
        let env = EvalEnv::bare(&graph);
        let tree = graph
            .node(stack)
            .unwrap()
            .evaluate_identifier(&env, EvalContext::for_frame(3))
            .unwrap();
        assert_eq!(tree.flatten(), "stack/over|clip0/3|clip1/3");
    }
}
