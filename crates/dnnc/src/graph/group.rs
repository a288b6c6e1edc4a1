use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{CompiledGroup, ExecutionStrategy, TargetArch};
use crate::ops::OpId;

use super::plan::ExecutionPlan;

/// Index of a group in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub(crate) usize);

impl GroupId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group{}", self.0)
    }
}

/// A scheduling unit: member ops plus the strategy and target they run under.
///
/// Membership is open until the graph is built; afterwards the group owns its plan and the
/// backend artifact built from it.
pub struct Group {
    id: GroupId,
    name: String,
    strategy: ExecutionStrategy,
    target: TargetArch,
    members: Vec<OpId>,
    pub(super) plan: Option<ExecutionPlan>,
    pub(super) compiled: Option<Box<dyn CompiledGroup>>,
}

impl Group {
    pub(super) fn new(id: GroupId, strategy: ExecutionStrategy, target: TargetArch) -> Self {
        Group {
            id,
            name: id.to_string(),
            strategy,
            target,
            members: Vec::new(),
            plan: None,
            compiled: None,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn target(&self) -> TargetArch {
        self.target
    }

    /// Member ops in insertion order.
    pub fn members(&self) -> &[OpId] {
        &self.members
    }

    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    pub fn compile_time(&self) -> Option<Duration> {
        self.compiled.as_ref().and_then(|compiled| compiled.compile_time())
    }

    pub(super) fn push_member(&mut self, op: OpId) {
        self.members.push(op);
    }

    pub(super) fn set_strategy(&mut self, strategy: ExecutionStrategy, target: TargetArch) {
        self.strategy = strategy;
        self.target = target;
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("target", &self.target)
            .field("members", &self.members)
            .field("plan", &self.plan)
            .field("compiled", &self.compiled.is_some())
            .finish()
    }
}
