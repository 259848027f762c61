//! NodeKind - closed enum over all node types.
//!
//! The graph stores and dispatches nodes through this enum; there is no
//! runtime type inspection anywhere. Adding a kind means adding a variant
//! and its delegation arms.

use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext};
use crate::error::EvalError;
use crate::graph::attrs::Attrs;
use crate::graph::graph::Graph;
use crate::graph::group_node::GroupNode;
use crate::graph::image::{IdTree, Image};
use crate::graph::node::{
    EvalContext, EvalEnv, FlushClass, Node, RangeInfo, StructureInfo,
};
use crate::graph::retime_node::RetimeNode;
use crate::graph::sequence_node::SequenceNode;
use crate::graph::source_node::SourceNode;
use crate::graph::stack_node::StackNode;

/// Closed set of node types
pub enum NodeKind {
    Source(SourceNode),
    Retime(RetimeNode),
    Sequence(SequenceNode),
    Stack(StackNode),
    Group(GroupNode),
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Source(_))
    }

    pub fn as_source(&self) -> Option<&SourceNode> {
        match self {
            NodeKind::Source(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_retime(&self) -> Option<&RetimeNode> {
        match self {
            NodeKind::Retime(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_stack(&self) -> Option<&StackNode> {
        match self {
            NodeKind::Stack(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&SequenceNode> {
        match self {
            NodeKind::Sequence(n) => Some(n),
            _ => None,
        }
    }
}

// Delegate the Node trait to the inner node
impl Node for NodeKind {
    fn uuid(&self) -> Uuid {
        match self {
            NodeKind::Source(n) => n.uuid(),
            NodeKind::Retime(n) => n.uuid(),
            NodeKind::Sequence(n) => n.uuid(),
            NodeKind::Stack(n) => n.uuid(),
            NodeKind::Group(n) => n.uuid(),
        }
    }

    fn name(&self) -> &str {
        match self {
            NodeKind::Source(n) => n.name(),
            NodeKind::Retime(n) => n.name(),
            NodeKind::Sequence(n) => n.name(),
            NodeKind::Stack(n) => n.name(),
            NodeKind::Group(n) => n.name(),
        }
    }

    fn node_type(&self) -> &'static str {
        match self {
            NodeKind::Source(n) => n.node_type(),
            NodeKind::Retime(n) => n.node_type(),
            NodeKind::Sequence(n) => n.node_type(),
            NodeKind::Stack(n) => n.node_type(),
            NodeKind::Group(n) => n.node_type(),
        }
    }

    fn attrs(&self) -> &Attrs {
        match self {
            NodeKind::Source(n) => n.attrs(),
            NodeKind::Retime(n) => n.attrs(),
            NodeKind::Sequence(n) => n.attrs(),
            NodeKind::Stack(n) => n.attrs(),
            NodeKind::Group(n) => n.attrs(),
        }
    }

    fn attrs_mut(&mut self) -> &mut Attrs {
        match self {
            NodeKind::Source(n) => n.attrs_mut(),
            NodeKind::Retime(n) => n.attrs_mut(),
            NodeKind::Sequence(n) => n.attrs_mut(),
            NodeKind::Stack(n) => n.attrs_mut(),
            NodeKind::Group(n) => n.attrs_mut(),
        }
    }

    fn inputs(&self) -> &[Uuid] {
        match self {
            NodeKind::Source(n) => n.inputs(),
            NodeKind::Retime(n) => n.inputs(),
            NodeKind::Sequence(n) => n.inputs(),
            NodeKind::Stack(n) => n.inputs(),
            NodeKind::Group(n) => n.inputs(),
        }
    }

    fn set_inputs(&mut self, inputs: Vec<Uuid>) {
        match self {
            NodeKind::Source(n) => n.set_inputs(inputs),
            NodeKind::Retime(n) => n.set_inputs(inputs),
            NodeKind::Sequence(n) => n.set_inputs(inputs),
            NodeKind::Stack(n) => n.set_inputs(inputs),
            NodeKind::Group(n) => n.set_inputs(inputs),
        }
    }

    fn max_inputs(&self) -> usize {
        match self {
            NodeKind::Source(n) => n.max_inputs(),
            NodeKind::Retime(n) => n.max_inputs(),
            NodeKind::Sequence(n) => n.max_inputs(),
            NodeKind::Stack(n) => n.max_inputs(),
            NodeKind::Group(n) => n.max_inputs(),
        }
    }

    fn evaluate(&self, env: &EvalEnv, ctx: EvalContext) -> Result<Image, EvalError> {
        match self {
            NodeKind::Source(n) => n.evaluate(env, ctx),
            NodeKind::Retime(n) => n.evaluate(env, ctx),
            NodeKind::Sequence(n) => n.evaluate(env, ctx),
            NodeKind::Stack(n) => n.evaluate(env, ctx),
            NodeKind::Group(n) => n.evaluate(env, ctx),
        }
    }

    fn evaluate_identifier(&self, env: &EvalEnv, ctx: EvalContext) -> Result<IdTree, EvalError> {
        match self {
            NodeKind::Source(n) => n.evaluate_identifier(env, ctx),
            NodeKind::Retime(n) => n.evaluate_identifier(env, ctx),
            NodeKind::Sequence(n) => n.evaluate_identifier(env, ctx),
            NodeKind::Stack(n) => n.evaluate_identifier(env, ctx),
            NodeKind::Group(n) => n.evaluate_identifier(env, ctx),
        }
    }

    fn range_info(&self, graph: &Graph) -> RangeInfo {
        match self {
            NodeKind::Source(n) => n.range_info(graph),
            NodeKind::Retime(n) => n.range_info(graph),
            NodeKind::Sequence(n) => n.range_info(graph),
            NodeKind::Stack(n) => n.range_info(graph),
            NodeKind::Group(n) => n.range_info(graph),
        }
    }

    fn structure_info(&self, graph: &Graph, ctx: EvalContext) -> StructureInfo {
        match self {
            NodeKind::Source(n) => n.structure_info(graph, ctx),
            NodeKind::Retime(n) => n.structure_info(graph, ctx),
            NodeKind::Sequence(n) => n.structure_info(graph, ctx),
            NodeKind::Stack(n) => n.structure_info(graph, ctx),
            NodeKind::Group(n) => n.structure_info(graph, ctx),
        }
    }

    fn audio_fill_buffer(
        &self,
        env: &EvalEnv,
        buf: &mut AudioBuffer,
        actx: AudioContext,
    ) -> usize {
        match self {
            NodeKind::Source(n) => n.audio_fill_buffer(env, buf, actx),
            NodeKind::Retime(n) => n.audio_fill_buffer(env, buf, actx),
            NodeKind::Sequence(n) => n.audio_fill_buffer(env, buf, actx),
            NodeKind::Stack(n) => n.audio_fill_buffer(env, buf, actx),
            NodeKind::Group(n) => n.audio_fill_buffer(env, buf, actx),
        }
    }

    fn property_changed(&self, key: &str) -> FlushClass {
        match self {
            NodeKind::Source(n) => n.property_changed(key),
            NodeKind::Retime(n) => n.property_changed(key),
            NodeKind::Sequence(n) => n.property_changed(key),
            NodeKind::Stack(n) => n.property_changed(key),
            NodeKind::Group(n) => n.property_changed(key),
        }
    }

    fn input_range_changed(&self) {
        match self {
            NodeKind::Source(n) => n.input_range_changed(),
            NodeKind::Retime(n) => n.input_range_changed(),
            NodeKind::Sequence(n) => n.input_range_changed(),
            NodeKind::Stack(n) => n.input_range_changed(),
            NodeKind::Group(n) => n.input_range_changed(),
        }
    }

    fn input_structure_changed(&self) {
        match self {
            NodeKind::Source(n) => n.input_structure_changed(),
            NodeKind::Retime(n) => n.input_structure_changed(),
            NodeKind::Sequence(n) => n.input_structure_changed(),
            NodeKind::Stack(n) => n.input_structure_changed(),
            NodeKind::Group(n) => n.input_structure_changed(),
        }
    }

    fn map_input_to_eval_frames(&self, index: usize, frames: &[i32], graph: &Graph) -> Vec<i32> {
        match self {
            NodeKind::Source(n) => n.map_input_to_eval_frames(index, frames, graph),
            NodeKind::Retime(n) => n.map_input_to_eval_frames(index, frames, graph),
            NodeKind::Sequence(n) => n.map_input_to_eval_frames(index, frames, graph),
            NodeKind::Stack(n) => n.map_input_to_eval_frames(index, frames, graph),
            NodeKind::Group(n) => n.map_input_to_eval_frames(index, frames, graph),
        }
    }
}

// Convenience From implementations
impl From<SourceNode> for NodeKind {
    fn from(node: SourceNode) -> Self {
        NodeKind::Source(node)
    }
}

impl From<RetimeNode> for NodeKind {
    fn from(node: RetimeNode) -> Self {
        NodeKind::Retime(node)
    }
}

impl From<SequenceNode> for NodeKind {
    fn from(node: SequenceNode) -> Self {
        NodeKind::Sequence(node)
    }
}

impl From<StackNode> for NodeKind {
    fn from(node: StackNode) -> Self {
        NodeKind::Stack(node)
    }
}

impl From<GroupNode> for NodeKind {
    fn from(node: GroupNode) -> Self {
        NodeKind::Group(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_dispatch() {
        let kind: NodeKind = RetimeNode::new("rt").into();
        assert_eq!(kind.node_type(), "retime");
        assert!(!kind.is_leaf());
        assert!(kind.as_retime().is_some());
        assert!(kind.as_source().is_none());
        assert_eq!(kind.max_inputs(), 1);
    }
}
