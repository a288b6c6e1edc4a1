//! Execution backend interface and the registry that maps strategies to backends.

pub mod registry;
pub mod spec;

pub use spec::{
    BackendError, BackendResult, CompiledGroup, ExecutionBackend, ExecutionStrategy, GroupView,
    TargetArch,
};
