//! GroupNode - wraps a chain of nodes behind a single vertex.
//!
//! The last input is the chain's output; everything delegates to it. Useful
//! for treating a source + retime pipeline as one unit in a larger graph.

use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext};
use crate::error::EvalError;
use crate::graph::attrs::Attrs;
use crate::graph::graph::Graph;
use crate::graph::image::{IdTree, Image};
use crate::graph::node::{
    EvalContext, EvalEnv, FlushClass, Node, RangeInfo, StructureInfo,
};

pub struct GroupNode {
    uuid: Uuid,
    name: String,
    attrs: Attrs,
    inputs: Vec<Uuid>,
}

impl GroupNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            attrs: Attrs::new(),
            inputs: Vec::new(),
        }
    }

    fn root(&self) -> Option<Uuid> {
        self.inputs.last().copied()
    }
}

impl Node for GroupNode {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> &'static str {
        "group"
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
    }

    fn evaluate(&self, env: &EvalEnv, ctx: EvalContext) -> Result<Image, EvalError> {
        let Some(root) = self.root() else {
            return Ok(Image::no_image(self.uuid));
        };
        let node = env.graph.node(root).ok_or(EvalError::UnknownNode(root))?;
        node.evaluate(env, ctx)
    }

    fn evaluate_identifier(&self, env: &EvalEnv, ctx: EvalContext) -> Result<IdTree, EvalError> {
        let Some(root) = self.root() else {
            return Ok(IdTree::leaf("no-image"));
        };
        let node = env.graph.node(root).ok_or(EvalError::UnknownNode(root))?;
        node.evaluate_identifier(env, ctx)
    }

    fn range_info(&self, graph: &Graph) -> RangeInfo {
        self.root()
            .and_then(|id| graph.node(id))
            .map(|n| n.range_info(graph))
            .unwrap_or_default()
    }

    fn structure_info(&self, graph: &Graph, ctx: EvalContext) -> StructureInfo {
        self.root()
            .and_then(|id| graph.node(id))
            .map(|n| n.structure_info(graph, ctx))
            .unwrap_or_default()
    }

    fn audio_fill_buffer(
        &self,
        env: &EvalEnv,
        buf: &mut AudioBuffer,
        actx: AudioContext,
    ) -> usize {
        match self.root().and_then(|id| env.graph.node(id)) {
            Some(node) => node.audio_fill_buffer(env, buf, actx),
            None => 0,
        }
    }

    fn property_changed(&self, _key: &str) -> FlushClass {
        FlushClass::NONE
    }

    fn input_range_changed(&self) {}

    fn input_structure_changed(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::retime_node::RetimeNode;
    use crate::graph::source_node::SourceNode;
    use crate::media::{FrameReader, SyntheticReader};
    use std::sync::Arc;

    #[test]
    fn test_group_delegates_to_chain_output() {
        let mut graph = Graph::new();
        let reader = Arc::new(SyntheticReader::new("clip", 1, 48, 24.0));
        let src = graph.add_node(SourceNode::new("clip", reader as Arc<dyn FrameReader>).into());
        let rt = graph.add_node(RetimeNode::new("retime").into());
        graph.set_node_inputs(rt, vec![src]).unwrap();
        let grp = graph.add_node(GroupNode::new("pipeline").into());
        graph.set_node_inputs(grp, vec![src, rt]).unwrap();

        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(grp)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(7))
            .unwrap();
        assert_eq!(img.payload.as_ref().unwrap().data[0], 7.0);
        assert_eq!(graph.node(grp).unwrap().range_info(&graph).end, 48);
    }

    #[test]
    fn test_empty_group_is_no_image() {
        let mut graph = Graph::new();
        let grp = graph.add_node(GroupNode::new("pipeline").into());
        let env = EvalEnv::bare(&graph);
        let img = graph
            .node(grp)
            .unwrap()
            .evaluate(&env, EvalContext::for_frame(1))
            .unwrap();
        assert!(img.is_no_image());
    }
}
