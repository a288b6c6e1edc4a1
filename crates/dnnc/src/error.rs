use thiserror::Error;

use crate::backend::BackendError;
use crate::tensor::TensorError;

/// Errors reported by graph construction, build, parameter injection, and run.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("an op named `{0}` already exists")]
    DuplicateOp(String),
    #[error("no op named `{0}`")]
    UnknownOp(String),
    #[error("no group with id {0}")]
    UnknownGroup(usize),
    #[error("invalid op `{name}`: {reason}")]
    InvalidOp { name: String, reason: String },
    #[error("parameters for `{name}` do not match: {reason}")]
    ParamMismatch { name: String, reason: String },
    #[error("missing input `{0}`")]
    MissingInput(String),
    #[error("input `{name}` does not match: {reason}")]
    InputMismatch { name: String, reason: String },
    #[error("group {group} contains a cycle through {ops:?}")]
    Cycle { group: usize, ops: Vec<String> },
    #[error("op `{op}` in group {group} reads `{input}` produced by later group {producer_group}")]
    GroupOrder {
        op: String,
        group: usize,
        input: String,
        producer_group: usize,
    },
    #[error("graph has not been built")]
    NotBuilt,
    #[error("graph has already been built")]
    AlreadyBuilt,
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl GraphError {
    /// True for every flavour of "this configuration is not implemented", including the ones
    /// raised inside a backend.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            GraphError::Unsupported(_) | GraphError::Backend(BackendError::Unsupported { .. })
        )
    }
}

pub type GraphResult<T> = Result<T, GraphError>;
