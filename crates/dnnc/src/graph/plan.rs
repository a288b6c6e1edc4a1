//! Per-group execution planning: topological order and boundary sets.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::error::{GraphError, GraphResult};
use crate::ops::{OpArena, OpId, OpKind};

use super::group::GroupId;

/// Execution plan of one group, computed once at build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    /// Members in an order where every in-group producer precedes its consumers.
    pub order: Vec<OpId>,
    /// Members with no in-group producer.
    pub inputs: Vec<OpId>,
    /// Members read by another group or requested as a final graph output.
    pub outputs: Vec<OpId>,
    /// Tensors the group reads from outside: out-of-group producers and its own data ops.
    pub external: Vec<OpId>,
}

/// Name-resolved form of a plan, for logs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub group: String,
    pub order: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub external: Vec<String>,
}

impl ExecutionPlan {
    pub fn is_output(&self, op: OpId) -> bool {
        self.outputs.contains(&op)
    }

    pub fn summary(&self, group: GroupId, arena: &OpArena) -> PlanSummary {
        let names = |ids: &[OpId]| -> Vec<String> {
            ids.iter().map(|&id| arena.node(id).name().to_string()).collect()
        };
        PlanSummary {
            group: group.to_string(),
            order: names(&self.order),
            inputs: names(&self.inputs),
            outputs: names(&self.outputs),
            external: names(&self.external),
        }
    }

    pub fn to_json(&self, group: GroupId, arena: &OpArena) -> String {
        serde_json::to_string(&self.summary(group, arena)).unwrap_or_default()
    }
}

/// Plans one group.
///
/// Ready ops are taken in lexicographic name order, so the order is deterministic for a given
/// graph regardless of insertion order.
pub fn plan_group(
    arena: &OpArena,
    group: GroupId,
    members: &[OpId],
    requested: &HashSet<OpId>,
) -> GraphResult<ExecutionPlan> {
    let member_set: HashSet<OpId> = members.iter().copied().collect();

    let mut pending: HashMap<OpId, usize> = members
        .iter()
        .map(|&id| {
            let count = arena
                .node(id)
                .inputs()
                .iter()
                .filter(|input| member_set.contains(input))
                .count();
            (id, count)
        })
        .collect();

    let inputs: Vec<OpId> = members
        .iter()
        .copied()
        .filter(|id| pending[id] == 0)
        .collect();

    let outputs: Vec<OpId> = members
        .iter()
        .copied()
        .filter(|&id| {
            requested.contains(&id)
                || arena
                    .consumers(id)
                    .iter()
                    .any(|&consumer| arena.node(consumer).group() != group)
        })
        .collect();

    let mut ready: BTreeSet<(&str, OpId)> = inputs
        .iter()
        .map(|&id| (arena.node(id).name(), id))
        .collect();
    let mut order = Vec::with_capacity(members.len());
    while let Some(entry) = ready.pop_first() {
        let (_, id) = entry;
        order.push(id);
        for &consumer in arena.consumers(id) {
            let Some(count) = pending.get_mut(&consumer) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                ready.insert((arena.node(consumer).name(), consumer));
            }
        }
    }

    if order.len() != members.len() {
        let ordered: HashSet<OpId> = order.iter().copied().collect();
        let mut stuck: Vec<String> = members
            .iter()
            .filter(|id| !ordered.contains(id))
            .map(|&id| arena.node(id).name().to_string())
            .collect();
        stuck.sort();
        return Err(GraphError::Cycle {
            group: group.index(),
            ops: stuck,
        });
    }

    let mut external = Vec::new();
    let mut seen = HashSet::new();
    for &id in &order {
        let node = arena.node(id);
        if matches!(node.kind(), OpKind::Data(_)) && seen.insert(id) {
            external.push(id);
        }
        for &input in node.inputs() {
            if !member_set.contains(&input) && seen.insert(input) {
                external.push(input);
            }
        }
    }

    Ok(ExecutionPlan {
        order,
        inputs,
        outputs,
        external,
    })
}
