use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{ExecutionPlan, GroupId};
use crate::ops::{OpArena, OpId, OpNode};
use crate::tensor::TensorValue;

/// How a group's ops are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// Direct per-op computation.
    Reference,
    /// The whole group is lowered to one fused program and compiled ahead of time.
    Compiled,
}

impl ExecutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStrategy::Reference => "reference",
            ExecutionStrategy::Compiled => "compiled",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reference" | "ref" => Ok(ExecutionStrategy::Reference),
            "compiled" | "c" => Ok(ExecutionStrategy::Compiled),
            other => Err(format!("unknown execution strategy '{other}'")),
        }
    }
}

/// Coarse device tag that steers a backend's parallelization choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetArch {
    Cpu,
    Gpu,
}

impl TargetArch {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetArch::Cpu => "cpu",
            TargetArch::Gpu => "gpu",
        }
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend error surfaced to the graph.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} is not supported: {reason}")]
    Unsupported { op: &'static str, reason: String },
    #[error("compilation failed: {message}")]
    Compile { message: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unsupported {
            op,
            reason: reason.into(),
        }
    }

    pub fn compile(message: impl Into<String>) -> Self {
        BackendError::Compile {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Read-only view of one planned group, handed to a backend at build time.
#[derive(Clone, Copy)]
pub struct GroupView<'a> {
    pub id: GroupId,
    pub name: &'a str,
    pub target: TargetArch,
    pub plan: &'a ExecutionPlan,
    pub arena: &'a OpArena,
}

impl<'a> GroupView<'a> {
    pub fn node(&self, id: OpId) -> &'a OpNode {
        self.arena.node(id)
    }

    /// Member ops in execution order.
    pub fn ordered(&self) -> impl Iterator<Item = (OpId, &'a OpNode)> + 'a {
        let arena = self.arena;
        self.plan.order.iter().map(move |&id| (id, arena.node(id)))
    }

    /// Position of `id` in the plan's external input list.
    pub fn external_slot(&self, id: OpId) -> Option<usize> {
        self.plan.external.iter().position(|&ext| ext == id)
    }
}

/// An execution engine able to turn a planned group into a runnable artifact.
pub trait ExecutionBackend: Send + Sync {
    /// Returns a human-readable backend identifier (e.g., `"ref-cpu"`, `"c"`).
    fn backend_name(&self) -> &str;

    /// Prepares everything `run` needs: output buffers, parameter copies, compiled code.
    fn build_group(&self, group: &GroupView<'_>) -> BackendResult<Box<dyn CompiledGroup>>;
}

/// Backend artifact bound to one group, created once at build and reused by every run.
pub trait CompiledGroup: Send {
    /// Recomputes every member op.
    ///
    /// `external` holds one tensor per entry of the plan's `external` list, in the same order.
    fn run(&mut self, external: &[&TensorValue]) -> BackendResult<()>;

    /// Latest result of a member op, if the backend keeps it addressable.
    ///
    /// Every plan output is always available after a successful run.
    fn output(&self, op: OpId) -> Option<&TensorValue>;

    /// Replaces the parameter tensors bound for `op` without rebuilding.
    fn update_params(&mut self, op: OpId, params: &[TensorValue]) -> BackendResult<()>;

    /// Wall-clock time spent compiling this group, for backends that compile.
    fn compile_time(&self) -> Option<Duration> {
        None
    }
}
