//! Graph entities - nodes, properties, evaluation results.

pub mod attrs;
pub mod graph;
pub mod group_node;
pub mod image;
pub mod keys;
pub mod node;
pub mod node_kind;
pub mod retime_node;
pub mod sequence_node;
pub mod source_node;
pub mod stack_node;

pub use attrs::{AttrValue, Attrs};
pub use graph::{Graph, NodeDefinition, NodeRegistry};
pub use group_node::GroupNode;
pub use image::{BlendMode, IdTree, Image, RenderKind};
pub use node::{
    EvalContext, EvalEnv, Eye, FlushClass, Node, RangeInfo, StructureInfo, ThreadKind,
};
pub use node_kind::NodeKind;
pub use retime_node::RetimeNode;
pub use sequence_node::SequenceNode;
pub use source_node::SourceNode;
pub use stack_node::StackNode;
