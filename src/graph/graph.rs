//! Graph - owns all nodes, edits topology, propagates invalidation.
//!
//! Nodes are owned by the graph's id map; input lists are plain ids used
//! only for traversal. Evaluation is shared-read (any number of worker
//! threads walk the graph concurrently); every mutation goes through the
//! `&mut self` methods here, which the scheduler serializes behind its
//! graph-edit bracket.
//!
//! Range/structure invalidation flows downstream through the reverse edge
//! map: a property or input change marks dependents dirty and queues
//! observer events, it never recomputes anything eagerly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use lazy_static::lazy_static;
use log::debug;
use uuid::Uuid;

use crate::audio::{AudioBuffer, AudioContext};
use crate::cache::frame_cache::FrameCache;
use crate::error::{EvalError, GraphError};
use crate::events::{GraphEvent, GraphObservers};
use crate::graph::attrs::{AttrValue, Attrs};
use crate::graph::group_node::GroupNode;
use crate::graph::image::{IdTree, Image};
use crate::graph::node::{EvalContext, EvalEnv, FlushClass, Node, RangeInfo};
use crate::graph::node_kind::NodeKind;
use crate::graph::retime_node::RetimeNode;
use crate::graph::sequence_node::SequenceNode;
use crate::graph::stack_node::StackNode;
use crate::pool::StagingPool;

/// An instantiable node type, as registered by an external node manager
pub struct NodeDefinition {
    pub type_name: &'static str,
    pub max_inputs: usize,
    pub defaults: Attrs,
    pub factory: fn(&str) -> NodeKind,
}

/// Registry of instantiable node kinds
pub struct NodeRegistry {
    defs: HashMap<&'static str, NodeDefinition>,
}

fn make_retime(name: &str) -> NodeKind {
    RetimeNode::new(name).into()
}

fn make_sequence(name: &str) -> NodeKind {
    SequenceNode::new(name).into()
}

fn make_stack(name: &str) -> NodeKind {
    StackNode::new(name).into()
}

fn make_group(name: &str) -> NodeKind {
    GroupNode::new(name).into()
}

lazy_static! {
    /// (type name, max inputs, factory) for the built-in kinds. Sources are
    /// constructed directly with their reader and added via add_node.
    static ref BUILTIN_KINDS: Vec<(&'static str, usize, fn(&str) -> NodeKind)> = vec![
        ("retime", 1, make_retime as fn(&str) -> NodeKind),
        ("sequence", usize::MAX, make_sequence),
        ("stack", usize::MAX, make_stack),
        ("group", usize::MAX, make_group),
    ];
}

impl NodeRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self {
            defs: HashMap::new(),
        };
        for (type_name, max_inputs, factory) in BUILTIN_KINDS.iter() {
            registry.register(NodeDefinition {
                type_name,
                max_inputs: *max_inputs,
                defaults: Attrs::new(),
                factory: *factory,
            });
        }
        registry
    }

    pub fn register(&mut self, def: NodeDefinition) {
        self.defs.insert(def.type_name, def);
    }

    pub fn definition(&self, type_name: &str) -> Option<&NodeDefinition> {
        self.defs.get(type_name)
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.defs.keys().copied().collect();
        names.sort();
        names
    }
}

pub struct Graph {
    /// Insertion-ordered so traversal and name lookup are deterministic
    nodes: IndexMap<Uuid, NodeKind>,
    /// Reverse edges: node -> nodes listing it as an input
    outputs: HashMap<Uuid, Vec<Uuid>>,
    observers: Arc<GraphObservers>,
    registry: NodeRegistry,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            outputs: HashMap::new(),
            observers: Arc::new(GraphObservers::new()),
            registry: NodeRegistry::builtin(),
        }
    }

    pub fn observers(&self) -> Arc<GraphObservers> {
        Arc::clone(&self.observers)
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut NodeRegistry {
        &mut self.registry
    }

    // ========== Topology ==========

    /// Add a constructed node; returns its id
    pub fn add_node(&mut self, node: NodeKind) -> Uuid {
        let id = node.uuid();
        debug!("add node '{}' ({}) {}", node.name(), node.node_type(), id);
        self.nodes.insert(id, node);
        self.outputs.entry(id).or_default();
        self.observers.emit(GraphEvent::NodeAdded(id));
        id
    }

    /// Instantiate a registered node type
    pub fn new_node(&mut self, type_name: &str, name: &str) -> Result<Uuid, GraphError> {
        let def = self
            .registry
            .definition(type_name)
            .ok_or_else(|| GraphError::UnknownType(type_name.to_string()))?;
        let mut node = (def.factory)(name);
        node.attrs_mut().apply_defaults(&def.defaults);
        Ok(self.add_node(node))
    }

    pub fn remove_node(&mut self, id: Uuid) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::UnknownNode(id));
        }
        self.observers.emit(GraphEvent::NodeWillRemove(id));

        // Disconnect downstream users
        let users = self.outputs.remove(&id).unwrap_or_default();
        for user in &users {
            if let Some(node) = self.nodes.get_mut(user) {
                let inputs: Vec<Uuid> =
                    node.inputs().iter().copied().filter(|i| *i != id).collect();
                node.set_inputs(inputs);
            }
        }

        // Drop reverse edges from our inputs
        let node = self.nodes.shift_remove(&id).unwrap();
        for input in node.inputs() {
            if let Some(outs) = self.outputs.get_mut(input) {
                outs.retain(|o| *o != id);
            }
        }

        for user in users {
            self.propagate_range_change(user);
        }
        Ok(())
    }

    /// Rewire a node's ordered input list.
    ///
    /// Rejects unknown ids, arity violations and cycles; on success the
    /// node and everything downstream of it is range-invalidated.
    pub fn set_node_inputs(&mut self, id: Uuid, inputs: Vec<Uuid>) -> Result<(), GraphError> {
        let node = self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))?;
        let name = node.name().to_string();
        let max = node.max_inputs();
        if inputs.len() > max {
            return Err(GraphError::TooManyInputs {
                name,
                max,
                got: inputs.len(),
            });
        }
        for input in &inputs {
            if !self.nodes.contains_key(input) {
                return Err(GraphError::UnknownNode(*input));
            }
            if *input == id || self.reaches(*input, id) {
                return Err(GraphError::Cycle { name: name.clone() });
            }
        }

        let old: Vec<Uuid> = self.nodes[&id].inputs().to_vec();
        for input in &old {
            if let Some(outs) = self.outputs.get_mut(input) {
                outs.retain(|o| *o != id);
            }
        }
        for input in &inputs {
            self.outputs.entry(*input).or_default().push(id);
        }

        self.nodes.get_mut(&id).unwrap().set_inputs(inputs);
        self.observers.emit(GraphEvent::InputsChanged(id));
        self.propagate_range_change(id);
        self.propagate_structure_change(id);
        Ok(())
    }

    /// True when `target` is reachable from `from` walking input edges
    fn reaches(&self, from: Uuid, target: Uuid) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.inputs().iter().copied());
            }
        }
        false
    }

    // ========== Properties ==========

    /// Set one property and report what the edit invalidates. The caller
    /// (normally the scheduler's edit bracket) applies the flush.
    pub fn set_attr(
        &mut self,
        id: Uuid,
        key: &str,
        value: AttrValue,
    ) -> Result<FlushClass, GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        node.attrs_mut().set(key, value);
        let flush = node.property_changed(key);

        self.observers.emit(GraphEvent::PropertyChanged {
            node: id,
            key: key.to_string(),
        });
        self.propagate_range_change(id);
        Ok(flush)
    }

    // ========== Queries ==========

    pub fn node(&self, id: Uuid) -> Option<&NodeKind> {
        self.nodes.get(&id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&NodeKind> {
        self.nodes.values().find(|n| n.name() == name)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> Vec<Uuid> {
        self.nodes.keys().copied().collect()
    }

    /// Nodes that list `id` as an input
    pub fn dependents(&self, id: Uuid) -> &[Uuid] {
        self.outputs.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn range_info(&self, id: Uuid) -> Option<RangeInfo> {
        self.nodes.get(&id).map(|n| n.range_info(self))
    }

    // ========== Evaluation entry points ==========

    pub fn evaluate(&self, id: Uuid, ctx: EvalContext) -> Result<Image, EvalError> {
        let env = EvalEnv::bare(self);
        self.nodes
            .get(&id)
            .ok_or(EvalError::UnknownNode(id))?
            .evaluate(&env, ctx)
    }

    pub fn evaluate_cached(
        &self,
        id: Uuid,
        cache: &FrameCache,
        pool: Option<&StagingPool>,
        ctx: EvalContext,
    ) -> Result<Image, EvalError> {
        let env = EvalEnv {
            graph: self,
            cache: Some(cache),
            pool,
        };
        self.nodes
            .get(&id)
            .ok_or(EvalError::UnknownNode(id))?
            .evaluate(&env, ctx)
    }

    pub fn evaluate_identifier(&self, id: Uuid, ctx: EvalContext) -> Result<IdTree, EvalError> {
        let env = EvalEnv::bare(self);
        self.nodes
            .get(&id)
            .ok_or(EvalError::UnknownNode(id))?
            .evaluate_identifier(&env, ctx)
    }

    pub fn audio_fill(&self, id: Uuid, buf: &mut AudioBuffer, actx: AudioContext) -> usize {
        let env = EvalEnv::bare(self);
        match self.nodes.get(&id) {
            Some(node) => node.audio_fill_buffer(&env, buf, actx),
            None => 0,
        }
    }

    // ========== Invalidation ==========

    /// Mark `from` and everything downstream range-dirty
    fn propagate_range_change(&self, from: Uuid) {
        self.observers.emit(GraphEvent::RangeChanged(from));
        let mut seen = HashSet::from([from]);
        let mut queue: VecDeque<Uuid> =
            self.outputs.get(&from).cloned().unwrap_or_default().into();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                node.input_range_changed();
                self.observers.emit(GraphEvent::RangeChanged(id));
            }
            if let Some(outs) = self.outputs.get(&id) {
                queue.extend(outs.iter().copied());
            }
        }
    }

    fn propagate_structure_change(&self, from: Uuid) {
        self.observers.emit(GraphEvent::StructureChanged(from));
        let mut seen = HashSet::from([from]);
        let mut queue: VecDeque<Uuid> =
            self.outputs.get(&from).cloned().unwrap_or_default().into();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                node.input_structure_changed();
                self.observers.emit(GraphEvent::StructureChanged(id));
            }
            if let Some(outs) = self.outputs.get(&id) {
                queue.extend(outs.iter().copied());
            }
        }
    }
}
