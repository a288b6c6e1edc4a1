//! Graph orchestrator: owns ops and groups, builds every group once, runs them in order.
//!
//! ## Lifecycle
//!
//! ```text
//! add_group / add_op  ->  build(outputs)  ->  run(inputs) ...
//!        Unbuilt              Built             Built
//! ```
//!
//! `build` plans each group (see [`plan_group`]) and hands the plan to the backend selected by
//! the group's [`ExecutionStrategy`]. `run` executes the groups in creation order; a group reads
//! the outputs of earlier groups before falling back to the caller's inputs.

mod group;
mod plan;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::backend::registry;
use crate::backend::{ExecutionBackend, ExecutionStrategy, GroupView, TargetArch};
use crate::error::{GraphError, GraphResult};
use crate::ops::shape::{self, InputDesc};
use crate::ops::{OpArena, OpId, OpKind, OpNode};
use crate::params::Params;
use crate::profiling;
use crate::tensor::{TensorValue, MAX_RANK};

pub use group::{Group, GroupId};
pub use plan::{plan_group, ExecutionPlan, PlanSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Unbuilt,
    Built,
}

/// A static dataflow graph partitioned into groups.
pub struct Graph {
    arena: OpArena,
    groups: Vec<Group>,
    outputs: Vec<OpId>,
    state: BuildState,
    backends: HashMap<ExecutionStrategy, Arc<dyn ExecutionBackend>>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut strategies: Vec<_> = self.backends.keys().collect();
        strategies.sort();
        f.debug_struct("Graph")
            .field("ops", &self.arena.len())
            .field("groups", &self.groups)
            .field("outputs", &self.outputs)
            .field("state", &self.state)
            .field("backends", &strategies)
            .finish()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            arena: OpArena::new(),
            groups: Vec::new(),
            outputs: Vec::new(),
            state: BuildState::Unbuilt,
            backends: HashMap::new(),
        }
    }

    /// Attaches a backend instance for `strategy`, taking precedence over the global registry.
    pub fn with_backend(
        mut self,
        strategy: ExecutionStrategy,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        self.backends.insert(strategy, backend);
        self
    }

    /// Creates an empty group. The strategy is always chosen by the caller.
    pub fn add_group(&mut self, strategy: ExecutionStrategy, target: TargetArch) -> GroupId {
        let id = GroupId(self.groups.len());
        self.groups.push(Group::new(id, strategy, target));
        id
    }

    /// Changes a group's strategy and target. Only allowed before `build`.
    pub fn set_group_strategy(
        &mut self,
        group: GroupId,
        strategy: ExecutionStrategy,
        target: TargetArch,
    ) -> GraphResult<()> {
        self.ensure_unbuilt()?;
        self.group_mut(group)?.set_strategy(strategy, target);
        Ok(())
    }

    /// Adds an op to `group`, validating its inputs and fixing its output shape.
    pub fn add_op(
        &mut self,
        name: impl Into<String>,
        kind: OpKind,
        inputs: &[OpId],
        group: GroupId,
    ) -> GraphResult<OpId> {
        let name = name.into();
        self.ensure_unbuilt()?;
        if group.index() >= self.groups.len() {
            return Err(GraphError::UnknownGroup(group.index()));
        }
        if name.is_empty() {
            return Err(GraphError::InvalidOp {
                name,
                reason: "op names must not be empty".to_string(),
            });
        }
        if self.arena.lookup(&name).is_some() {
            return Err(GraphError::DuplicateOp(name));
        }
        if let Some(missing) = inputs.iter().find(|&&id| !self.arena.contains(id)) {
            return Err(GraphError::UnknownOp(missing.to_string()));
        }

        let descs: Vec<InputDesc<'_>> = inputs
            .iter()
            .map(|&id| {
                let node = self.arena.node(id);
                InputDesc {
                    dims: node.dims(),
                    dtype: node.dtype(),
                }
            })
            .collect();
        let signature = shape::infer(&kind, &descs).map_err(|reason| GraphError::InvalidOp {
            name: name.clone(),
            reason,
        })?;
        if signature.dims.len() > MAX_RANK {
            log::error!(
                "op `{name}` would produce a rank-{} buffer; at most {MAX_RANK} dimensions are supported",
                signature.dims.len()
            );
            return Err(GraphError::Unsupported(format!(
                "op `{name}` output rank {} exceeds {MAX_RANK}",
                signature.dims.len()
            )));
        }

        let node = OpNode::new(
            name,
            kind,
            inputs.to_vec(),
            group,
            signature.dtype,
            signature.dims,
            &signature.params,
        );
        let id = self.arena.insert(node);
        self.groups[group.index()].push_member(id);
        Ok(id)
    }

    /// Plans and builds every group for the requested outputs. Must be called exactly once.
    pub fn build(&mut self, outputs: &[&str]) -> GraphResult<()> {
        self.ensure_unbuilt()?;
        let _scope = profiling::compile_scope("graph.build");

        let mut requested = Vec::with_capacity(outputs.len());
        for &name in outputs {
            let id = self
                .arena
                .lookup(name)
                .ok_or_else(|| GraphError::UnknownOp(name.to_string()))?;
            if !requested.contains(&id) {
                requested.push(id);
            }
        }
        let requested_set: HashSet<OpId> = requested.iter().copied().collect();

        let strategies: Vec<ExecutionStrategy> = self.groups.iter().map(Group::strategy).collect();
        let backends = strategies
            .into_iter()
            .map(|strategy| self.backend_for(strategy))
            .collect::<GraphResult<Vec<_>>>()?;

        let mut built = Vec::with_capacity(self.groups.len());
        for (group, backend) in self.groups.iter().zip(backends) {
            self.check_group_order(group)?;
            let plan = plan_group(&self.arena, group.id(), group.members(), &requested_set)?;
            if crate::env::log_plans_enabled() {
                log::info!("plan {}", plan.to_json(group.id(), &self.arena));
            } else {
                log::debug!("{:?}", plan.summary(group.id(), &self.arena));
            }

            let view = GroupView {
                id: group.id(),
                name: group.name(),
                target: group.target(),
                plan: &plan,
                arena: &self.arena,
            };
            let compiled = backend.build_group(&view)?;
            log::info!(
                "built {} ({} ops) with the {} backend for {}",
                group.name(),
                plan.order.len(),
                backend.backend_name(),
                group.target()
            );
            built.push((plan, compiled));
        }

        for (group, (plan, compiled)) in self.groups.iter_mut().zip(built) {
            group.plan = Some(plan);
            group.compiled = Some(compiled);
        }
        self.outputs = requested;
        self.state = BuildState::Built;
        Ok(())
    }

    /// Overwrites the parameter slots of the named ops without touching built groups.
    ///
    /// Every entry is validated before anything is written.
    pub fn initialize_params(&mut self, params: &Params) -> GraphResult<()> {
        let mut targets = Vec::with_capacity(params.len());
        for (name, tensors) in params {
            let id = self
                .arena
                .lookup(name)
                .ok_or_else(|| GraphError::UnknownOp(name.clone()))?;
            let node = self.arena.node(id);
            if node.params().len() != tensors.len() {
                return Err(GraphError::ParamMismatch {
                    name: name.clone(),
                    reason: format!(
                        "expected {} tensors, got {}",
                        node.params().len(),
                        tensors.len()
                    ),
                });
            }
            for (slot, (current, incoming)) in node.params().iter().zip(tensors).enumerate() {
                current
                    .ensure_same_layout(incoming)
                    .map_err(|err| GraphError::ParamMismatch {
                        name: name.clone(),
                        reason: format!("slot {slot}: {err}"),
                    })?;
            }
            targets.push(id);
        }

        for (id, tensors) in targets.into_iter().zip(params.values()) {
            if let Some(node) = self.arena.get_mut(id) {
                for (slot, incoming) in node.params_mut().iter_mut().zip(tensors) {
                    slot.copy_from(incoming)?;
                }
            }
        }
        Ok(())
    }

    /// Overwrites parameters and pushes them into every built group that owns one of the ops.
    ///
    /// If a group rejects the update, the previous parameters are restored in the graph and in
    /// every group that had already accepted the new ones.
    pub fn set_params(&mut self, params: &Params) -> GraphResult<()> {
        if self.state != BuildState::Built {
            return self.initialize_params(params);
        }
        let previous: Params = params
            .keys()
            .filter_map(|name| {
                self.op_by_name(name)
                    .map(|node| (name.clone(), node.params().to_vec()))
            })
            .collect();
        self.initialize_params(params)?;

        let mut pushed = Vec::with_capacity(params.len());
        for name in params.keys() {
            match self.push_params(name) {
                Ok(()) => pushed.push(name.as_str()),
                Err(err) => {
                    self.initialize_params(&previous)?;
                    for &name in &pushed {
                        if let Err(restore) = self.push_params(name) {
                            log::warn!("could not restore parameters of `{name}`: {restore}");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn push_params(&mut self, name: &str) -> GraphResult<()> {
        let Some(id) = self.arena.lookup(name) else {
            return Ok(());
        };
        let node = self.arena.node(id);
        let group = &mut self.groups[node.group().index()];
        if let Some(compiled) = group.compiled.as_mut() {
            compiled.update_params(id, node.params())?;
        }
        Ok(())
    }

    /// Copies out the parameters of every op that has any.
    pub fn extract_params(&self) -> Params {
        self.arena
            .iter()
            .filter(|(_, node)| !node.params().is_empty())
            .map(|(_, node)| (node.name().to_string(), node.params().to_vec()))
            .collect()
    }

    /// Runs every group in creation order and returns the requested outputs by name.
    pub fn run(
        &mut self,
        inputs: &HashMap<String, TensorValue>,
    ) -> GraphResult<HashMap<String, TensorValue>> {
        if self.state != BuildState::Built {
            return Err(GraphError::NotBuilt);
        }
        let _scope = profiling::backend_scope("graph.run");

        let arena = &self.arena;
        let groups = &mut self.groups;
        for index in 0..groups.len() {
            let (earlier, rest) = groups.split_at_mut(index);
            let group = &mut rest[0];
            let plan = group.plan.as_ref().ok_or(GraphError::NotBuilt)?;

            let mut bound: Vec<&TensorValue> = Vec::with_capacity(plan.external.len());
            for &ext in &plan.external {
                let node = arena.node(ext);
                let handed_off = (node.group() != group.id())
                    .then(|| {
                        earlier
                            .get(node.group().index())
                            .and_then(|producer| producer.compiled.as_ref())
                            .and_then(|compiled| compiled.output(ext))
                    })
                    .flatten();
                let value = match handed_off {
                    Some(value) => value,
                    None => inputs
                        .get(node.name())
                        .ok_or_else(|| GraphError::MissingInput(node.name().to_string()))?,
                };
                check_input(node, value)?;
                bound.push(value);
            }

            let compiled = group.compiled.as_mut().ok_or(GraphError::NotBuilt)?;
            compiled.run(&bound)?;
        }

        let mut results = HashMap::with_capacity(self.outputs.len());
        for &id in &self.outputs {
            let node = self.arena.node(id);
            let value = self.groups[node.group().index()]
                .compiled
                .as_ref()
                .and_then(|compiled| compiled.output(id))
                .ok_or_else(|| GraphError::MissingInput(node.name().to_string()))?;
            results.insert(node.name().to_string(), value.clone());
        }
        Ok(results)
    }

    /// Lists op names group by group, one line per group.
    pub fn display_ops(&self) -> String {
        let mut out = String::new();
        for group in &self.groups {
            let names: Vec<&str> = group
                .members()
                .iter()
                .map(|&id| self.arena.node(id).name())
                .collect();
            let line = format!(
                "{} [{}/{}]: {}",
                group.name(),
                group.strategy(),
                group.target(),
                names.join(", ")
            );
            log::info!("{line}");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    pub fn is_built(&self) -> bool {
        self.state == BuildState::Built
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn arena(&self) -> &OpArena {
        &self.arena
    }

    pub fn op(&self, id: OpId) -> Option<&OpNode> {
        self.arena.get(id)
    }

    pub fn op_id(&self, name: &str) -> Option<OpId> {
        self.arena.lookup(name)
    }

    pub fn op_by_name(&self, name: &str) -> Option<&OpNode> {
        self.arena.lookup(name).map(|id| self.arena.node(id))
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id.index())
    }

    pub fn plan(&self, id: GroupId) -> Option<&ExecutionPlan> {
        self.group(id).and_then(Group::plan)
    }

    /// Requested outputs, in the order given to `build`.
    pub fn outputs(&self) -> &[OpId] {
        &self.outputs
    }

    fn ensure_unbuilt(&self) -> GraphResult<()> {
        match self.state {
            BuildState::Unbuilt => Ok(()),
            BuildState::Built => Err(GraphError::AlreadyBuilt),
        }
    }

    fn group_mut(&mut self, id: GroupId) -> GraphResult<&mut Group> {
        self.groups
            .get_mut(id.index())
            .ok_or(GraphError::UnknownGroup(id.index()))
    }

    fn check_group_order(&self, group: &Group) -> GraphResult<()> {
        for &id in group.members() {
            let node = self.arena.node(id);
            for &input in node.inputs() {
                let producer = self.arena.node(input);
                if producer.group() > group.id() {
                    return Err(GraphError::GroupOrder {
                        op: node.name().to_string(),
                        group: group.id().index(),
                        input: producer.name().to_string(),
                        producer_group: producer.group().index(),
                    });
                }
            }
        }
        Ok(())
    }

    fn backend_for(&mut self, strategy: ExecutionStrategy) -> GraphResult<Arc<dyn ExecutionBackend>> {
        if let Some(backend) = self.backends.get(&strategy) {
            return Ok(Arc::clone(backend));
        }
        let backend = registry::create_backend(strategy).ok_or_else(|| {
            GraphError::Unsupported(format!("no backend registered for the {strategy} strategy"))
        })?;
        self.backends.insert(strategy, Arc::clone(&backend));
        Ok(backend)
    }
}

fn check_input(node: &OpNode, value: &TensorValue) -> GraphResult<()> {
    if value.dtype() != node.dtype() || value.dims() != node.dims() {
        return Err(GraphError::InputMismatch {
            name: node.name().to_string(),
            reason: format!(
                "expected {} {:?}, got {} {:?}",
                node.dtype(),
                node.dims(),
                value.dtype(),
                value.dims()
            ),
        });
    }
    Ok(())
}
