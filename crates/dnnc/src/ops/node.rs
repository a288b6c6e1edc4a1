//! Arena-allocated operation nodes addressed by integer handles.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::GroupId;
use crate::tensor::{DType, Dims, TensorValue};

use super::kind::OpKind;

/// Handle to a node in an [`OpArena`]. Handles are only issued for nodes already inserted, so
/// inputs always refer to earlier nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub(crate) u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// One vertex of the dataflow graph.
#[derive(Debug, Clone)]
pub struct OpNode {
    name: String,
    kind: OpKind,
    inputs: Vec<OpId>,
    group: GroupId,
    dtype: DType,
    dims: Dims,
    params: Vec<TensorValue>,
    param_grads: Vec<TensorValue>,
}

impl OpNode {
    pub(crate) fn new(
        name: String,
        kind: OpKind,
        inputs: Vec<OpId>,
        group: GroupId,
        dtype: DType,
        dims: Dims,
        param_dims: &[Vec<usize>],
    ) -> Self {
        let params = param_dims
            .iter()
            .map(|dims| TensorValue::zeros(dtype, dims))
            .collect::<Vec<_>>();
        let param_grads = param_dims.iter().map(|_| TensorValue::empty(dtype)).collect();
        OpNode {
            name,
            kind,
            inputs,
            group,
            dtype,
            dims,
            params,
            param_grads,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[OpId] {
        &self.inputs
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Output extents, fixed when the node was created.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn params(&self) -> &[TensorValue] {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut [TensorValue] {
        &mut self.params
    }

    /// Gradient slots, one per parameter. Forward inference never populates them.
    pub fn param_grads(&self) -> &[TensorValue] {
        &self.param_grads
    }
}

/// Owns every node of a graph and the name index over them.
#[derive(Debug, Default)]
pub struct OpArena {
    nodes: Vec<OpNode>,
    consumers: Vec<Vec<OpId>>,
    by_name: HashMap<String, OpId>,
}

impl OpArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts a validated node. The caller guarantees the name is unused and every input
    /// handle belongs to this arena.
    pub(crate) fn insert(&mut self, node: OpNode) -> OpId {
        let id = OpId(self.nodes.len() as u32);
        for input in node.inputs() {
            self.consumers[input.index()].push(id);
        }
        self.by_name.insert(node.name().to_string(), id);
        self.nodes.push(node);
        self.consumers.push(Vec::new());
        id
    }

    pub fn contains(&self, id: OpId) -> bool {
        id.index() < self.nodes.len()
    }

    pub fn get(&self, id: OpId) -> Option<&OpNode> {
        self.nodes.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: OpId) -> Option<&mut OpNode> {
        self.nodes.get_mut(id.index())
    }

    /// Panics if `id` was not issued by this arena.
    pub fn node(&self, id: OpId) -> &OpNode {
        &self.nodes[id.index()]
    }

    pub fn lookup(&self, name: &str) -> Option<OpId> {
        self.by_name.get(name).copied()
    }

    /// Nodes that read the output of `id`, in insertion order.
    pub fn consumers(&self, id: OpId) -> &[OpId] {
        &self.consumers[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpId, &OpNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (OpId(idx as u32), node))
    }
}
