//! RetimeNode - linear, explicit-table and non-linear time remapping.
//!
//! Three styles, in precedence order:
//! - explicit: an array property maps each output frame (index offset from a
//!   configured first output frame) to an input frame
//! - warp: sparse (frame, rate) keys drive a lazily built pair of
//!   monotonic index arrays, one per direction
//! - linear: scale/offset, with an fps correction when the configured
//!   output fps differs from the detected input fps by more than an epsilon
//!
//! Forward mapping (`retimed_frame`) goes output->input; the inverse
//! (`inv_retimed_frame`) returns the smallest output frame mapping to a
//! given input frame, since scaling makes either direction many-to-one.

use std::sync::Arc;

use log::warn;
use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext, time_to_samples};
use crate::config::{FPS_EPSILON, WARP_EPSILON};
use crate::error::EvalError;
use crate::graph::attrs::{AttrValue, Attrs};
use crate::graph::graph::Graph;
use crate::graph::image::{IdTree, Image};
use crate::graph::keys::*;
use crate::graph::node::{
    EvalContext, EvalEnv, FlushClass, Node, RangeInfo, StructureInfo,
};
use crate::memo::Memoized;

/// Dense inverse of the explicit remap table
#[derive(Debug, Clone)]
struct ExplicitInverse {
    first_input_frame: i32,
    /// in-frame offset -> smallest mapped output frame, gaps held forward
    in_to_out: Vec<i32>,
}

/// Monotonic warp index arrays, one entry per frame in each domain
#[derive(Debug, Clone)]
struct WarpTables {
    in_to_out: Vec<i32>,
    out_to_in: Vec<i32>,
}

pub struct RetimeNode {
    uuid: Uuid,
    name: String,
    attrs: Attrs,
    inputs: Vec<Uuid>,
    input_info: Memoized<RangeInfo>,
    self_info: Memoized<RangeInfo>,
    explicit_inv: Memoized<Option<Arc<ExplicitInverse>>>,
    warp: Memoized<Option<Arc<WarpTables>>>,
}

impl RetimeNode {
    pub fn new(name: impl Into<String>) -> Self {
        let mut attrs = Attrs::new();
        attrs.set(A_SCALE, AttrValue::Float(1.0));
        attrs.set(A_OFFSET, AttrValue::Float(0.0));
        attrs.set(A_AUDIO_SCALE, AttrValue::Float(1.0));
        attrs.set(A_AUDIO_OFFSET, AttrValue::Float(0.0));
        attrs.set(A_OUTPUT_FPS, AttrValue::Float(0.0));
        attrs.set(A_WARP_ACTIVE, AttrValue::Bool(false));
        attrs.set(A_WARP_STYLE, AttrValue::Int(0));
        attrs.set(A_EXPLICIT_ACTIVE, AttrValue::Bool(false));
        attrs.set(A_EXPLICIT_FIRST_OUTPUT, AttrValue::Int(1));

        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            attrs,
            inputs: Vec::new(),
            input_info: Memoized::new(),
            self_info: Memoized::new(),
            explicit_inv: Memoized::new(),
            warp: Memoized::new(),
        }
    }

    fn input_info(&self, graph: &Graph) -> RangeInfo {
        self.input_info.get_or_update(|| {
            self.inputs
                .first()
                .and_then(|id| graph.node(*id))
                .map(|n| n.range_info(graph))
                .unwrap_or_default()
        })
    }

    /// Output fps: the configured value, or the detected input fps while
    /// the property is still 0.
    fn output_fps(&self, graph: &Graph) -> f32 {
        let fps = self.attrs.get_float_or(A_OUTPUT_FPS, 0.0);
        if fps != 0.0 {
            fps
        } else {
            self.input_info(graph).fps
        }
    }

    /// Effective linear scale with the fps correction folded in.
    ///
    /// Stored fps values carry only ~6 significant digits, so differences
    /// below FPS_EPSILON are precision loss from a session round-trip, not a
    /// retime request.
    fn effective_scale(&self, graph: &Graph) -> f32 {
        let mut scale = self.attrs.get_float_or(A_SCALE, 1.0);
        let fps = self.output_fps(graph);
        let info = self.input_info(graph);

        if fps != info.fps && info.fps != 0.0 {
            let fps_scale = fps / info.fps;
            if (fps_scale - 1.0).abs() > FPS_EPSILON {
                scale *= fps_scale;
            }
        }

        if scale == 0.0 { 1.0 } else { scale }
    }

    fn explicit_active(&self) -> bool {
        self.attrs.get_bool_or(A_EXPLICIT_ACTIVE, false)
    }

    fn warp_active(&self) -> bool {
        self.attrs.get_bool_or(A_WARP_ACTIVE, false)
    }

    /// Build the dense inverse of the explicit table. The table maps output
    /// offsets to input frames; a given input frame may be referenced by
    /// several outputs, and the inverse keeps the smallest.
    fn explicit_inverse(&self) -> Option<Arc<ExplicitInverse>> {
        self.explicit_inv.get_or_update(|| {
            let table = self.attrs.get_int_list(A_EXPLICIT_INPUT_FRAMES)?;
            if table.is_empty() {
                warn!(
                    "retime '{}': explicit retiming active, but no input frames set",
                    self.name
                );
                return None;
            }
            let first_output = self.attrs.get_i32_or(A_EXPLICIT_FIRST_OUTPUT, 1);

            let min_input = *table.iter().min().unwrap();
            let max_input = *table.iter().max().unwrap();

            let mut in_to_out = vec![i32::MAX; (max_input - min_input + 1) as usize];
            for (i, input) in table.iter().enumerate() {
                let idx = (input - min_input) as usize;
                let out_f = i as i32 + first_output;
                if in_to_out[idx] > out_f {
                    in_to_out[idx] = out_f;
                }
            }

            // Hold the last known mapping across unreferenced input frames
            let mut held = first_output;
            for slot in in_to_out.iter_mut() {
                if *slot != i32::MAX {
                    held = *slot;
                } else {
                    *slot = held;
                }
            }

            Some(Arc::new(ExplicitInverse {
                first_input_frame: min_input,
                in_to_out,
            }))
        })
    }

    /// Rebuild the warp index arrays if the key data changed.
    ///
    /// Two "time gaps" (input-domain and output-domain) advance together by
    /// the smaller of the two per-frame steps; whenever a gap exceeds its
    /// frame period minus an epsilon, the corresponding array grows by one.
    /// The loop stops when the input side would run past the last frame.
    fn warp_tables(&self, graph: &Graph) -> Option<Arc<WarpTables>> {
        let info = self.input_info(graph);
        self.warp.get_or_update(|| {
            let frames = self.attrs.get_int_list(A_WARP_KEY_FRAMES).unwrap_or(&[]);
            let rates = self.attrs.get_float_list(A_WARP_KEY_RATES).unwrap_or(&[]);

            if frames.len() != rates.len() {
                warn!("retime '{}': warp key numbers don't match, skipping warp", self.name);
                return None;
            }

            let out_fps = self.output_fps(graph);
            if info.fps <= 0.0 || out_fps <= 0.0 {
                return None;
            }

            let style = self.attrs.get_i32_or(A_WARP_STYLE, 0);
            let input_time_step = 1.0f32 / info.fps;

            let mut in_to_out: Vec<i32> = vec![0];
            let mut out_to_in: Vec<i32> = vec![0];
            let mut input_gap = 0.0f32;
            let mut output_gap = 0.0f32;
            let mut key_index: usize = 0;

            loop {
                let input_frame = in_to_out.len() as i32 - 1;
                let output_frame = out_to_in.len() as i32 - 1;
                let mut scale = 1.0f32;

                if !frames.is_empty() {
                    // Keep the lower bound the greatest key at or below the
                    // current input frame
                    let mut next = key_index;
                    while next < frames.len() && input_frame >= frames[next] - info.start {
                        next += 1;
                    }

                    let (a_scale, a_frame, b_scale, b_frame);
                    if next == frames.len() {
                        key_index = frames.len() - 1;
                        a_scale = rates[key_index];
                        a_frame = frames[key_index] - info.start;
                        b_scale = a_scale;
                        b_frame = a_frame;
                    } else {
                        if key_index != next {
                            key_index = next - 1;
                        }
                        a_scale = rates[key_index];
                        a_frame = frames[key_index] - info.start;
                        if key_index < frames.len() - 1 {
                            b_scale = rates[key_index + 1];
                            b_frame = frames[key_index + 1] - info.start;
                        } else {
                            b_scale = a_scale;
                            b_frame = a_frame;
                        }
                    }

                    if style == 0 {
                        if input_frame < a_frame {
                            scale = a_scale;
                        } else if input_frame >= b_frame {
                            scale = b_scale;
                        } else {
                            let t = (input_frame - a_frame) as f32 / (b_frame - a_frame) as f32;
                            scale = (1.0 - t) * a_scale + t * b_scale;
                        }
                    } else if input_frame < b_frame {
                        scale = a_scale;
                    } else {
                        scale = b_scale;
                    }
                }

                // Rates must stay positive or neither gap ever fills
                let output_time_step = scale.max(0.001) / out_fps;

                let step = input_time_step.min(output_time_step);
                input_gap += step;
                output_gap += step;

                let need_input = input_gap > input_time_step - WARP_EPSILON;
                let need_output = output_gap > output_time_step - WARP_EPSILON;

                if need_input
                    && (input_frame + 1) as f32 > (info.end - info.start) as f32 + WARP_EPSILON
                {
                    break;
                }

                if need_input {
                    let target = if need_output {
                        output_frame + 1
                    } else {
                        *in_to_out.last().unwrap()
                    };
                    in_to_out.push(target);
                    input_gap = 0.0;
                }
                if need_output {
                    let target = if need_input {
                        input_frame + 1
                    } else {
                        *out_to_in.last().unwrap()
                    };
                    out_to_in.push(target);
                    output_gap = 0.0;
                }
            }

            Some(Arc::new(WarpTables { in_to_out, out_to_in }))
        })
    }

    /// Output -> input map. One-to-many when shortening; returns the first
    /// of the possible input frames.
    pub fn retimed_frame(&self, graph: &Graph, frame: i32) -> i32 {
        if self.explicit_active() {
            let Some(table) = self.attrs.get_int_list(A_EXPLICIT_INPUT_FRAMES) else {
                return 1;
            };
            if table.is_empty() {
                warn!(
                    "retime '{}': explicit retiming active, but no input frames set",
                    self.name
                );
                return 1;
            }
            let first_output = self.attrs.get_i32_or(A_EXPLICIT_FIRST_OUTPUT, 1);
            let index = (frame - first_output).clamp(0, table.len() as i32 - 1);
            return table[index as usize];
        }

        if self.warp_active() {
            if let Some(tables) = self.warp_tables(graph) {
                let info = self.input_info(graph);
                let f = frame.clamp(1, tables.out_to_in.len() as i32);
                return info.start + tables.out_to_in[(f - 1) as usize];
            }
            // Bad warp data degrades to the linear path
        }

        let info = self.input_info(graph);
        let scale = self.effective_scale(graph);
        let offset = self.attrs.get_float_or(A_OFFSET, 0.0);

        // Truncate rather than round: frame boundaries stay put, centers
        // don't matter here
        let fframe = (frame - info.start) as f32 / scale;
        fframe.floor() as i32 + info.start - offset as i32
    }

    /// Closed-form inverse candidate, before rounding correction
    fn inv_retimed_frame0(&self, graph: &Graph, frame: i32) -> i32 {
        let info = self.input_info(graph);
        let scale = self.effective_scale(graph);
        let offset = self.attrs.get_float_or(A_OFFSET, 0.0);

        let fframe = (frame - info.start + offset as i32) as f32 * scale;
        info.start + fframe.floor() as i32
    }

    /// Input -> output map: the smallest output frame the input frame is
    /// mapped from. Forward rounding is not invertible in closed form, so
    /// the candidate's neighborhood is searched for an exact preimage.
    pub fn inv_retimed_frame(&self, graph: &Graph, frame: i32) -> i32 {
        if self.explicit_active() {
            let first_output = self.attrs.get_i32_or(A_EXPLICIT_FIRST_OUTPUT, 1);
            let Some(inv) = self.explicit_inverse() else {
                return first_output;
            };
            let index =
                (frame - inv.first_input_frame).clamp(0, inv.in_to_out.len() as i32 - 1);
            return inv.in_to_out[index as usize];
        }

        if self.warp_active() {
            if let Some(tables) = self.warp_tables(graph) {
                let info = self.input_info(graph);
                let f = frame.clamp(info.start, info.end);
                let idx = ((f - info.start) as usize).min(tables.in_to_out.len() - 1);
                return 1 + tables.in_to_out[idx];
            }
        }

        let f = self.inv_retimed_frame0(graph, frame);
        if self.retimed_frame(graph, f) != frame {
            let mut f0 = self.inv_retimed_frame0(graph, frame - 1);
            let mut f1 = self.inv_retimed_frame0(graph, frame + 1);
            if f0 > f1 {
                std::mem::swap(&mut f0, &mut f1);
            }
            for g in f0..=f1 {
                if self.retimed_frame(graph, g) == frame {
                    return g;
                }
            }
        }
        f
    }

    fn compute_range(&self, graph: &Graph) -> RangeInfo {
        let mut info = self.input_info(graph);

        if self.explicit_active() {
            if let Some(table) = self.attrs.get_int_list(A_EXPLICIT_INPUT_FRAMES) {
                if !table.is_empty() {
                    let first_output = self.attrs.get_i32_or(A_EXPLICIT_FIRST_OUTPUT, 1);
                    info.start = first_output;
                    info.cut_in = first_output;
                    info.end = first_output + table.len() as i32 - 1;
                    info.cut_out = info.end;
                    return info;
                }
            }
            return info;
        }

        let mut istart = self.inv_retimed_frame(graph, info.start);
        let mut iend = self.inv_retimed_frame(graph, info.end);
        let mut iin = self.inv_retimed_frame(graph, info.cut_in);
        let mut iout = self.inv_retimed_frame(graph, info.cut_out);

        if info.cut_in == info.start {
            iin = istart;
        }
        if info.cut_out == info.end {
            iout = iend;
        }

        let fps = self.output_fps(graph);
        let vscale = self.attrs.get_float_or(A_SCALE, 1.0);

        if vscale.abs() > 1.0 || info.fps != fps {
            // The inverse returns the smallest preimage, but for the tail
            // frames the largest one is the real output end
            let inc = if vscale > 0.0 { 1 } else { -1 };
            let warp_len = if self.warp_active() {
                self.warp_tables(graph)
                    .map(|t| t.out_to_in.len() as i32)
                    .unwrap_or(i32::MAX)
            } else {
                i32::MAX
            };

            while self.retimed_frame(graph, iend + inc) == info.end {
                if self.warp_active() && iend + inc > warp_len {
                    break;
                }
                iend += inc;
            }
            while self.retimed_frame(graph, iout + inc) == info.cut_out {
                if self.warp_active() && iout + inc > warp_len {
                    break;
                }
                iout += inc;
            }
        }

        if istart > iend {
            std::mem::swap(&mut istart, &mut iend);
        }
        if iin > iout {
            std::mem::swap(&mut iin, &mut iout);
        }

        info.start = istart;
        info.end = iend;
        info.cut_in = iin;
        info.cut_out = iout;
        info.fps = fps;
        info
    }
}

impl Node for RetimeNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "retime"
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
        self.input_info.invalidate();
        self.self_info.invalidate();
        self.warp.invalidate();
    }

    fn max_inputs(&self) -> usize {
        1
    }

    fn evaluate(&self, env: &EvalEnv, ctx: EvalContext) -> Result<Image, EvalError> {
        let Some(&input) = self.inputs.first() else {
            return Ok(Image::no_image(self.uuid));
        };
        let node = env.graph.node(input).ok_or(EvalError::UnknownNode(input))?;
        node.evaluate(env, ctx.with_frame(self.retimed_frame(env.graph, ctx.frame)))
    }

    fn evaluate_identifier(&self, env: &EvalEnv, ctx: EvalContext) -> Result<IdTree, EvalError> {
        let Some(&input) = self.inputs.first() else {
            return Ok(IdTree::leaf("no-image"));
        };
        let node = env.graph.node(input).ok_or(EvalError::UnknownNode(input))?;
        node.evaluate_identifier(env, ctx.with_frame(self.retimed_frame(env.graph, ctx.frame)))
    }

    fn range_info(&self, graph: &Graph) -> RangeInfo {
        self.self_info.get_or_update(|| self.compute_range(graph))
    }

    fn structure_info(&self, graph: &Graph, ctx: EvalContext) -> StructureInfo {
        match self.inputs.first().and_then(|id| graph.node(*id)) {
            Some(node) => {
                node.structure_info(graph, ctx.with_frame(self.retimed_frame(graph, ctx.frame)))
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
        let Some(&input) = self.inputs.first() else {
            return 0;
        };
        let Some(node) = env.graph.node(input) else {
            return 0;
        };

        let fps = self.output_fps(env.graph);
        if fps <= 0.0 {
            return node.audio_fill_buffer(env, buf, actx);
        }
        let info = self.input_info(env.graph);

        let vscale = self.attrs.get_float_or(A_SCALE, 1.0);
        let ascale = self.attrs.get_float_or(A_AUDIO_SCALE, 1.0);
        let aoffset = self.attrs.get_float_or(A_AUDIO_OFFSET, 0.0);

        let fps_ratio = if actx.fps > 0.0 { actx.fps / fps } else { 1.0 };
        let vfactor = if vscale != 0.0 { fps_ratio / vscale } else { fps_ratio };
        // Reverse playback is the renderer's concern; only the magnitude
        // retimes samples here
        let factor = (vfactor * ascale).abs();

        let rate = buf.rate();
        let poffset_samples = time_to_samples(-aoffset as f64, rate);
        let sub_actx = AudioContext { fps: info.fps };

        if (factor - 1.0).abs() < 1e-6 {
            let mut scratch = AudioBuffer::like(buf, buf.start_sample() + poffset_samples);
            let n = node.audio_fill_buffer(env, &mut scratch, sub_actx);
            buf.mix_from(&scratch);
            return n;
        }

        // Stretch/compress by linear resampling of an input window scaled
        // by the factor
        let n = buf.len();
        let child_len = ((n as f64) * factor as f64).ceil() as usize + 2;
        let child_start = ((buf.start_sample() + poffset_samples) as f64 * factor as f64) as i64;
        let mut child = AudioBuffer::new(child_len, buf.channels(), rate, child_start);
        let filled = node.audio_fill_buffer(env, &mut child, sub_actx);
        if filled == 0 {
            return 0;
        }

        let ch = buf.channels() as usize;
        for i in 0..n {
            let src = i as f64 * factor as f64;
            let i0 = src.floor() as usize;
            let i1 = (i0 + 1).min(child_len - 1);
            let t = (src - i0 as f64) as f32;
            for c in 0..ch {
                let a = child.data()[i0 * ch + c];
                let b = child.data()[i1 * ch + c];
                buf.data_mut()[i * ch + c] += a * (1.0 - t) + b * t;
            }
        }
        n
    }

    fn property_changed(&self, key: &str) -> FlushClass {
        self.self_info.invalidate();
        self.explicit_inv.invalidate();
        self.warp.invalidate();
        match key {
            A_AUDIO_SCALE | A_AUDIO_OFFSET => FlushClass::AUDIO,
            A_NAME => FlushClass::NONE,
            A_OUTPUT_FPS | A_SCALE | A_OFFSET => FlushClass::FRAMES_AND_AUDIO,
            _ => FlushClass::FRAMES,
        }
    }

    fn input_range_changed(&self) {
        self.input_info.invalidate();
        self.self_info.invalidate();
        self.explicit_inv.invalidate();
        self.warp.invalidate();
    }

    fn input_structure_changed(&self) {
        // Structure is delegated, nothing cached here
    }

    fn map_input_to_eval_frames(&self, _index: usize, frames: &[i32], graph: &Graph) -> Vec<i32> {
        frames
            .iter()
            .map(|f| self.inv_retimed_frame(graph, *f))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node_kind::NodeKind;
    use crate::graph::source_node::SourceNode;
    use crate::media::{FrameReader, SyntheticReader};

    fn retime_over_source(start: i32, end: i32) -> (Graph, Uuid, Uuid) {
        let mut graph = Graph::new();
        let reader = Arc::new(SyntheticReader::new("clip", start, end, 24.0));
        let src = graph.add_node(SourceNode::new("clip", reader as Arc<dyn FrameReader>).into());
        let rt = graph.add_node(RetimeNode::new("retime").into());
        graph.set_node_inputs(rt, vec![src]).unwrap();
        (graph, rt, src)
    }

    fn retime<'a>(graph: &'a Graph, id: Uuid) -> &'a RetimeNode {
        match graph.node(id).unwrap() {
            NodeKind::Retime(n) => n,
            _ => panic!("not a retime"),
        }
    }

    fn set_scale(graph: &mut Graph, id: Uuid, scale: f32) {
        graph.set_attr(id, A_SCALE, AttrValue::Float(scale)).unwrap();
    }

    #[test]
    fn test_identity_scale_round_trip_exact() {
        let (graph, rt, _) = retime_over_source(1, 48);
        let node = retime(&graph, rt);
        for f in 1..=48 {
            let rf = node.retimed_frame(&graph, f);
            assert_eq!(node.inv_retimed_frame(&graph, rf), f, "frame {f}");
        }
    }

    #[test]
    fn test_scale_two_inverse_is_smallest_preimage() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        set_scale(&mut graph, rt, 2.0);
        let node = retime(&graph, rt);

        for f in 1..=48 {
            let g = node.inv_retimed_frame(&graph, f);
            assert_eq!(node.retimed_frame(&graph, g), f, "inverse lands on {f}");
            // Smallest such g: its predecessor must map elsewhere
            assert_ne!(node.retimed_frame(&graph, g - 1), f, "g not minimal for {f}");
        }
    }

    #[test]
    fn test_scale_half_forward_round_trip() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        set_scale(&mut graph, rt, 0.5);
        let node = retime(&graph, rt);
        // Halving length: retimed(out) jumps by 2; every input frame's
        // inverse must map back onto it
        for f in (1..=47).step_by(2) {
            let g = node.inv_retimed_frame(&graph, f);
            assert_eq!(node.retimed_frame(&graph, g), f);
        }
    }

    #[test]
    fn test_range_scales_with_length() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        set_scale(&mut graph, rt, 2.0);
        let info = graph.node(rt).unwrap().range_info(&graph);
        assert_eq!(info.start, 1);
        assert_eq!(info.end, 96);
    }

    #[test]
    fn test_explicit_remap_forward_and_inverse() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        graph
            .set_attr(rt, A_EXPLICIT_ACTIVE, AttrValue::Bool(true))
            .unwrap();
        graph
            .set_attr(
                rt,
                A_EXPLICIT_INPUT_FRAMES,
                AttrValue::IntList(vec![10, 10, 11, 13]),
            )
            .unwrap();
        let node = retime(&graph, rt);

        // 1->10, 2->10, 3->11, 4->13
        assert_eq!(node.retimed_frame(&graph, 1), 10);
        assert_eq!(node.retimed_frame(&graph, 2), 10);
        assert_eq!(node.retimed_frame(&graph, 3), 11);
        assert_eq!(node.retimed_frame(&graph, 4), 13);
        // Clamped outside the table
        assert_eq!(node.retimed_frame(&graph, 0), 10);
        assert_eq!(node.retimed_frame(&graph, 9), 13);

        // Smallest mapped output for a doubly-referenced input
        assert_eq!(node.inv_retimed_frame(&graph, 10), 1);
        assert_eq!(node.inv_retimed_frame(&graph, 11), 3);
        // Gap at 12 holds the last known mapping forward
        assert_eq!(node.inv_retimed_frame(&graph, 12), 3);
        assert_eq!(node.inv_retimed_frame(&graph, 13), 4);
    }

    #[test]
    fn test_explicit_range_covers_table() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        graph
            .set_attr(rt, A_EXPLICIT_ACTIVE, AttrValue::Bool(true))
            .unwrap();
        graph
            .set_attr(
                rt,
                A_EXPLICIT_INPUT_FRAMES,
                AttrValue::IntList(vec![10, 10, 11, 13]),
            )
            .unwrap();
        let info = graph.node(rt).unwrap().range_info(&graph);
        assert_eq!((info.start, info.end), (1, 4));
    }

    #[test]
    fn test_empty_explicit_table_degrades() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        graph
            .set_attr(rt, A_EXPLICIT_ACTIVE, AttrValue::Bool(true))
            .unwrap();
        graph
            .set_attr(rt, A_EXPLICIT_INPUT_FRAMES, AttrValue::IntList(vec![]))
            .unwrap();
        let node = retime(&graph, rt);
        assert_eq!(node.retimed_frame(&graph, 5), 1);
        assert_eq!(node.inv_retimed_frame(&graph, 5), 1);
    }

    #[test]
    fn test_warp_constant_rate_matches_linear() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        graph.set_attr(rt, A_WARP_ACTIVE, AttrValue::Bool(true)).unwrap();
        graph
            .set_attr(rt, A_WARP_KEY_FRAMES, AttrValue::IntList(vec![1]))
            .unwrap();
        graph
            .set_attr(rt, A_WARP_KEY_RATES, AttrValue::FloatList(vec![1.0]))
            .unwrap();
        let node = retime(&graph, rt);
        // Rate 1.0 everywhere: identity mapping frame by frame
        for f in 1..=48 {
            assert_eq!(node.retimed_frame(&graph, f), f);
        }
    }

    #[test]
    fn test_warp_slowdown_stretches_output() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        graph.set_attr(rt, A_WARP_ACTIVE, AttrValue::Bool(true)).unwrap();
        graph.set_attr(rt, A_WARP_STYLE, AttrValue::Int(1)).unwrap();
        graph
            .set_attr(rt, A_WARP_KEY_FRAMES, AttrValue::IntList(vec![1]))
            .unwrap();
        graph
            .set_attr(rt, A_WARP_KEY_RATES, AttrValue::FloatList(vec![0.5]))
            .unwrap();
        let node = retime(&graph, rt);
        // Half rate holds every input frame for ~2 output frames
        let info = node.range_info(&graph);
        assert!(info.end >= 90, "output should roughly double, got {}", info.end);
        assert_eq!(node.retimed_frame(&graph, 1), 1);
        assert_eq!(node.retimed_frame(&graph, 2), 1);
        assert_eq!(node.retimed_frame(&graph, 3), 2);
    }

    #[test]
    fn test_warp_mismatched_keys_degrades_to_linear() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        graph.set_attr(rt, A_WARP_ACTIVE, AttrValue::Bool(true)).unwrap();
        graph
            .set_attr(rt, A_WARP_KEY_FRAMES, AttrValue::IntList(vec![1, 10]))
            .unwrap();
        graph
            .set_attr(rt, A_WARP_KEY_RATES, AttrValue::FloatList(vec![1.0]))
            .unwrap();
        let node = retime(&graph, rt);
        for f in 1..=48 {
            assert_eq!(node.retimed_frame(&graph, f), f);
        }
    }

    #[test]
    fn test_warp_monotonic_over_random_keys() {
        // Inverse-map neighborhood search assumes local monotonicity; the
        // warp tables must be monotone for arbitrary positive key data
        let cases: Vec<(Vec<i32>, Vec<f32>)> = vec![
            (vec![1, 12, 30], vec![0.3, 2.5, 0.75]),
            (vec![5, 6, 7], vec![4.0, 0.1, 1.0]),
            (vec![1, 48], vec![1.7, 0.2]),
        ];
        for (case, (frames, rates)) in cases.into_iter().enumerate() {
            let (mut graph, rt, _) = retime_over_source(1, 48);
            graph.set_attr(rt, A_WARP_ACTIVE, AttrValue::Bool(true)).unwrap();
            graph
                .set_attr(rt, A_WARP_STYLE, AttrValue::Int((case % 2) as i32))
                .unwrap();
            graph
                .set_attr(rt, A_WARP_KEY_FRAMES, AttrValue::IntList(frames))
                .unwrap();
            graph
                .set_attr(rt, A_WARP_KEY_RATES, AttrValue::FloatList(rates))
                .unwrap();
            let node = retime(&graph, rt);
            let info = node.range_info(&graph);

            let mut prev = node.retimed_frame(&graph, info.start);
            for f in info.start + 1..=info.end {
                let cur = node.retimed_frame(&graph, f);
                assert!(cur >= prev, "forward map must be monotone at {f} (case {case})");
                prev = cur;
            }
        }
    }

    #[test]
    fn test_evaluate_pulls_remapped_frame() {
        let (mut graph, rt, _) = retime_over_source(1, 48);
        set_scale(&mut graph, rt, 2.0);
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(rt)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(10))
            .unwrap();
        // out 10 -> in floor((10-1)/2)+1 = 5
        assert_eq!(img.payload.as_ref().unwrap().data[0], 5.0);
    }

    #[test]
    fn test_no_input_yields_no_image() {
        let mut graph = Graph::new();
        let rt = graph.add_node(RetimeNode::new("retime").into());
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(rt)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(1))
            .unwrap();
        assert!(img.is_no_image());
    }
}
